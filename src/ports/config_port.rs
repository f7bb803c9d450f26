//! Configuration access port trait.

use std::str::FromStr;

use crate::domain::error::TradegateError;

/// Accepted boolean spellings, case-insensitive.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn checked<T: FromStr>(
    value: Option<String>,
    section: &str,
    key: &str,
    expected: &str,
) -> Result<Option<T>, TradegateError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            TradegateError::invalid_config(section, key, format!("expected {expected}, got {raw:?}"))
        }),
    }
}

pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    fn get_int(&self, section: &str, key: &str, default: i64) -> i64;
    fn get_double(&self, section: &str, key: &str, default: f64) -> f64;
    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool;

    /// True when the key is present, whatever its value.
    fn has_key(&self, section: &str, key: &str) -> bool {
        self.get_string(section, key).is_some()
    }

    /// `Ok(None)` when absent or empty, `ConfigInvalid` when present but
    /// not an integer.
    fn get_int_checked(&self, section: &str, key: &str) -> Result<Option<i64>, TradegateError> {
        checked(self.get_string(section, key), section, key, "an integer")
    }

    fn get_double_checked(&self, section: &str, key: &str) -> Result<Option<f64>, TradegateError> {
        let value = checked::<f64>(self.get_string(section, key), section, key, "a number")?;
        match value {
            Some(v) if !v.is_finite() => Err(TradegateError::invalid_config(
                section,
                key,
                "expected a finite number",
            )),
            other => Ok(other),
        }
    }

    fn get_bool_checked(&self, section: &str, key: &str) -> Result<Option<bool>, TradegateError> {
        match self.get_string(section, key).as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_bool(raw).map(Some).ok_or_else(|| {
                TradegateError::invalid_config(
                    section,
                    key,
                    format!("expected true/false, yes/no, on/off or 1/0, got {raw:?}"),
                )
            }),
        }
    }
}
