use clap::Parser;
use tradegate::cli::{Cli, run};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
