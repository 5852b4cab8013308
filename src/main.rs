//! vigil CLI entry point.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    vigil::cli::main(std::env::args()).await
}
