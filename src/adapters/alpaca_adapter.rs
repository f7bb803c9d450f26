//! Alpaca REST adapter for market data and order execution.
//!
//! Credentials are read from `ALPACA_API_KEY` / `ALPACA_SECRET_KEY`. The
//! trading endpoint (paper or live) comes from the validated configuration.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::config::AlpacaEndpoints;
use crate::domain::error::{BrokerError, TradegateError};
use crate::domain::ohlcv::Bar;
use crate::domain::order::{AckStatus, Order, OrderAck, OrderSide};
use crate::domain::position::Position;
use crate::ports::broker_port::{BrokerAccount, BrokerPort};
use crate::ports::market_data_port::MarketDataPort;

pub const API_KEY_VAR: &str = "ALPACA_API_KEY";
pub const SECRET_KEY_VAR: &str = "ALPACA_SECRET_KEY";

#[derive(Clone)]
pub struct AlpacaAdapter {
    client: Client,
    trading_url: String,
    data_url: String,
    timeframe: String,
    stream_poll: Duration,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<Vec<AlpacaBar>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct OrderRequest {
    symbol: String,
    qty: String,
    side: &'static str,
    #[serde(rename = "type")]
    order_type: &'static str,
    time_in_force: &'static str,
    client_order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AlpacaOrder {
    id: String,
    client_order_id: String,
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    cash: String,
    equity: String,
    #[serde(default)]
    initial_margin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    #[serde(default)]
    side: Option<String>,
}

fn parse_decimal(field: &str, value: &str) -> Result<f64, BrokerError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| BrokerError::Protocol(format!("invalid {field}: {value:?}")))
}

fn parse_optional(field: &str, value: Option<&str>) -> Result<f64, BrokerError> {
    match value {
        Some(v) if !v.trim().is_empty() => parse_decimal(field, v),
        _ => Ok(0.0),
    }
}

fn map_transport_error(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout
    } else if err.is_decode() {
        BrokerError::Protocol(err.to_string())
    } else {
        BrokerError::Network(err.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &str) -> BrokerError {
    let reason = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::NOT_FOUND => BrokerError::NotFound(reason),
        StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY => BrokerError::Rejected(reason),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BrokerError::Timeout,
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            BrokerError::Network(reason)
        }
        _ => BrokerError::Protocol(reason),
    }
}

fn map_order(order: &AlpacaOrder) -> Result<OrderAck, BrokerError> {
    let filled_quantity = parse_optional("filled_qty", order.filled_qty.as_deref())?.round() as i64;
    let average_price = parse_optional("filled_avg_price", order.filled_avg_price.as_deref())?;

    let status = match order.status.as_str() {
        "new" | "accepted" | "pending_new" | "accepted_for_bidding" | "calculated" | "held" => {
            AckStatus::Open
        }
        "partially_filled" | "filled" => AckStatus::Filled {
            filled_quantity,
            average_price,
        },
        "pending_cancel" | "pending_replace" | "stopped" | "suspended" => {
            if filled_quantity > 0 {
                AckStatus::Filled {
                    filled_quantity,
                    average_price,
                }
            } else {
                AckStatus::Open
            }
        }
        "canceled" | "expired" | "done_for_day" | "replaced" => AckStatus::Cancelled {
            filled_quantity,
            average_price,
        },
        "rejected" => AckStatus::Rejected(format!("order {} rejected", order.id)),
        other => {
            return Err(BrokerError::Protocol(format!(
                "unknown order status {other:?}"
            )));
        }
    };

    Ok(OrderAck {
        broker_order_id: order.id.clone(),
        client_order_id: order.client_order_id.clone(),
        status,
        commission: 0.0,
    })
}

fn map_position(position: &AlpacaPosition, at: DateTime<Utc>) -> Result<Position, BrokerError> {
    let mut quantity = parse_decimal("qty", &position.qty)?.round() as i64;
    if position.side.as_deref() == Some("short") && quantity > 0 {
        quantity = -quantity;
    }
    Ok(Position {
        symbol: position.symbol.clone(),
        quantity,
        average_entry_price: parse_decimal("avg_entry_price", &position.avg_entry_price)?,
        stop_loss_price: None,
        take_profit_price: None,
        opened_at: at,
    })
}

fn map_account(account: &AlpacaAccount) -> Result<BrokerAccount, BrokerError> {
    let balance = parse_decimal("cash", &account.cash)?;
    let equity = parse_decimal("equity", &account.equity)?;
    let margin_used = parse_optional("initial_margin", account.initial_margin.as_deref())?;
    Ok(BrokerAccount {
        balance,
        equity,
        margin_used,
        free_margin: equity - margin_used,
    })
}

fn map_bar(symbol: &str, bar: &AlpacaBar) -> Result<Bar, String> {
    let timestamp = DateTime::parse_from_rfc3339(&bar.t)
        .map_err(|e| format!("invalid bar timestamp {:?}: {e}", bar.t))?
        .with_timezone(&Utc);
    Ok(Bar {
        symbol: symbol.to_string(),
        timestamp,
        open: bar.o,
        high: bar.h,
        low: bar.l,
        close: bar.c,
        volume: bar.v,
    })
}

fn order_request(order: &Order) -> OrderRequest {
    OrderRequest {
        symbol: order.symbol.clone(),
        qty: order.quantity.to_string(),
        side: match order.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        },
        order_type: "market",
        time_in_force: "day",
        client_order_id: order.id.clone(),
    }
}

impl AlpacaAdapter {
    pub fn new(
        api_key: &str,
        secret_key: &str,
        endpoints: &AlpacaEndpoints,
        timeframe: &str,
        request_timeout: Duration,
    ) -> Result<Self, TradegateError> {
        let header = |name: &str, value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| TradegateError::invalid_config("alpaca", name, e.to_string()))
        };
        let mut headers = HeaderMap::new();
        headers.insert("APCA-API-KEY-ID", header(API_KEY_VAR, api_key)?);
        headers.insert("APCA-API-SECRET-KEY", header(SECRET_KEY_VAR, secret_key)?);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TradegateError::invalid_config("alpaca", "client", e.to_string()))?;

        Ok(Self {
            client,
            trading_url: endpoints.trading_url.trim_end_matches('/').to_string(),
            data_url: endpoints.data_url.trim_end_matches('/').to_string(),
            timeframe: timeframe.to_string(),
            stream_poll: Duration::from_secs(1),
        })
    }

    /// Build from the `ALPACA_API_KEY` and `ALPACA_SECRET_KEY` variables.
    pub fn from_env(
        endpoints: &AlpacaEndpoints,
        timeframe: &str,
        request_timeout: Duration,
    ) -> Result<Self, TradegateError> {
        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| TradegateError::missing_config("env", API_KEY_VAR))?;
        let secret_key = std::env::var(SECRET_KEY_VAR)
            .map_err(|_| TradegateError::missing_config("env", SECRET_KEY_VAR))?;
        Self::new(&api_key, &secret_key, endpoints, timeframe, request_timeout)
    }

    pub fn with_stream_poll(mut self, interval: Duration) -> Self {
        self.stream_poll = interval;
        self
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BrokerError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Bar>, TradegateError> {
        let market_err = |reason: String| TradegateError::MarketData {
            symbol: symbol.to_string(),
            reason,
        };

        let url = format!("{}/v2/stocks/{symbol}/bars", self.data_url);
        let request = self.client.get(&url).query(&[
            ("timeframe", timeframe.to_string()),
            ("limit", count.to_string()),
            ("sort", "desc".to_string()),
        ]);
        debug!(symbol, timeframe, count, "fetching bars");

        let response: BarsResponse = self
            .send(request)
            .await
            .map_err(|e| market_err(e.to_string()))?;

        let mut bars = response
            .bars
            .unwrap_or_default()
            .iter()
            .map(|b| map_bar(symbol, b))
            .collect::<Result<Vec<Bar>, String>>()
            .map_err(market_err)?;
        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }
}

#[async_trait]
impl MarketDataPort for AlpacaAdapter {
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Bar>, TradegateError> {
        self.fetch_bars(symbol, timeframe, count).await
    }

    /// Polls the latest bar and yields it whenever its timestamp moves.
    async fn subscribe_stream(
        &self,
        symbol: &str,
    ) -> Result<BoxStream<'static, Result<Bar, TradegateError>>, TradegateError> {
        let state = (self.clone(), symbol.to_string(), None::<DateTime<Utc>>);
        let stream = stream::unfold(state, |(adapter, symbol, last_seen)| async move {
            loop {
                tokio::time::sleep(adapter.stream_poll).await;
                match adapter.fetch_bars(&symbol, &adapter.timeframe, 1).await {
                    Ok(bars) => {
                        let Some(bar) = bars.into_iter().last() else {
                            continue;
                        };
                        if last_seen.is_some_and(|seen| bar.timestamp <= seen) {
                            continue;
                        }
                        let seen = Some(bar.timestamp);
                        return Some((Ok(bar), (adapter, symbol, seen)));
                    }
                    Err(e) => return Some((Err(e), (adapter, symbol, last_seen))),
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl BrokerPort for AlpacaAdapter {
    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError> {
        let url = format!("{}/v2/orders", self.trading_url);
        let body = order_request(order);
        debug!(order_id = %order.id, symbol = %order.symbol, side = %order.side, qty = order.quantity, "placing order");
        let placed: AlpacaOrder = self.send(self.client.post(&url).json(&body)).await?;
        map_order(&placed)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{broker_order_id}", self.trading_url);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let err = map_status_error(status, &body);
        warn!(broker_order_id, error = %err, "cancel failed");
        Err(err)
    }

    async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, BrokerError> {
        let url = format!("{}/v2/orders:by_client_order_id", self.trading_url);
        let request = self
            .client
            .get(&url)
            .query(&[("client_order_id", client_order_id)]);
        match self.send::<AlpacaOrder>(request).await {
            Ok(order) => map_order(&order).map(Some),
            Err(BrokerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_account(&self) -> Result<BrokerAccount, BrokerError> {
        let url = format!("{}/v2/account", self.trading_url);
        let account: AlpacaAccount = self.send(self.client.get(&url)).await?;
        map_account(&account)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let url = format!("{}/v2/positions", self.trading_url);
        let positions: Vec<AlpacaPosition> = self.send(self.client.get(&url)).await?;
        let now = Utc::now();
        positions.iter().map(|p| map_position(p, now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderPurpose;
    use chrono::TimeZone;

    fn alpaca_order(status: &str, filled: Option<&str>, avg: Option<&str>) -> AlpacaOrder {
        AlpacaOrder {
            id: "b-1".into(),
            client_order_id: "c-1".into(),
            status: status.into(),
            filled_qty: filled.map(String::from),
            filled_avg_price: avg.map(String::from),
        }
    }

    #[test]
    fn accepted_order_is_open() {
        let ack = map_order(&alpaca_order("new", Some("0"), None)).unwrap();
        assert_eq!(ack.status, AckStatus::Open);
        assert_eq!(ack.broker_order_id, "b-1");
        assert_eq!(ack.client_order_id, "c-1");
        assert_eq!(ack.commission, 0.0);
    }

    #[test]
    fn partial_and_full_fills_carry_cumulative_quantity() {
        let ack = map_order(&alpaca_order("partially_filled", Some("4"), Some("100.5"))).unwrap();
        assert_eq!(
            ack.status,
            AckStatus::Filled {
                filled_quantity: 4,
                average_price: 100.5
            }
        );
        let ack = map_order(&alpaca_order("filled", Some("10"), Some("100.25"))).unwrap();
        assert_eq!(
            ack.status,
            AckStatus::Filled {
                filled_quantity: 10,
                average_price: 100.25
            }
        );
    }

    #[test]
    fn cancelled_and_rejected_orders() {
        let ack = map_order(&alpaca_order("canceled", Some("3"), Some("99"))).unwrap();
        assert_eq!(
            ack.status,
            AckStatus::Cancelled {
                filled_quantity: 3,
                average_price: 99.0
            }
        );
        let ack = map_order(&alpaca_order("rejected", None, None)).unwrap();
        assert!(matches!(ack.status, AckStatus::Rejected(_)));
    }

    #[test]
    fn unknown_status_is_protocol_error() {
        let err = map_order(&alpaca_order("teleported", None, None)).unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn status_codes_map_to_broker_errors() {
        assert!(matches!(
            map_status_error(StatusCode::NOT_FOUND, "missing"),
            BrokerError::NotFound(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::FORBIDDEN, "buying power"),
            BrokerError::Rejected(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::UNPROCESSABLE_ENTITY, "qty"),
            BrokerError::Rejected(_)
        ));
        assert_eq!(
            map_status_error(StatusCode::GATEWAY_TIMEOUT, ""),
            BrokerError::Timeout
        );
        assert!(map_status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(map_status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            map_status_error(StatusCode::BAD_REQUEST, "bad"),
            BrokerError::Protocol(_)
        ));
    }

    #[test]
    fn order_request_uses_order_id_as_client_id() {
        let order = Order::market(
            "SPY",
            OrderSide::Sell,
            7,
            101.0,
            OrderPurpose::StopLoss,
            Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
        );
        let request = order_request(&order);
        assert_eq!(request.client_order_id, order.id);
        assert_eq!(request.side, "sell");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "market");
        assert_eq!(json["qty"], "7");
        assert_eq!(json["time_in_force"], "day");
    }

    #[test]
    fn short_positions_are_negative() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        let short = AlpacaPosition {
            symbol: "QQQ".into(),
            qty: "5".into(),
            avg_entry_price: "400.10".into(),
            side: Some("short".into()),
        };
        let pos = map_position(&short, at).unwrap();
        assert_eq!(pos.quantity, -5);
        assert_eq!(pos.average_entry_price, 400.10);

        let already_signed = AlpacaPosition {
            qty: "-5".into(),
            ..short
        };
        assert_eq!(map_position(&already_signed, at).unwrap().quantity, -5);
    }

    #[test]
    fn account_free_margin_is_equity_less_margin() {
        let account: AlpacaAccount = serde_json::from_str(
            r#"{"cash": "90000.50", "equity": "100000", "initial_margin": "2500"}"#,
        )
        .unwrap();
        let mapped = map_account(&account).unwrap();
        assert_eq!(mapped.balance, 90000.5);
        assert_eq!(mapped.margin_used, 2500.0);
        assert_eq!(mapped.free_margin, 97500.0);
    }

    #[test]
    fn bars_response_parses() {
        let response: BarsResponse = serde_json::from_str(
            r#"{"bars": [{"t": "2024-01-02T14:30:00Z", "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "v": 1200}],
                "symbol": "SPY", "next_page_token": null}"#,
        )
        .unwrap();
        let bars = response.bars.unwrap();
        let bar = map_bar("SPY", &bars[0]).unwrap();
        assert_eq!(bar.close, 1.5);
        assert_eq!(bar.volume, 1200.0);
        assert_eq!(
            bar.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap()
        );

        let empty: BarsResponse = serde_json::from_str(r#"{"bars": null}"#).unwrap();
        assert!(empty.bars.is_none());
    }
}
