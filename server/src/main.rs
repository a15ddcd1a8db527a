//! Shim binary that calls into the `reading_diary_server` library's `inner_main`.

use clap::Parser as _;
use eyre::Result;
use reading_diary_server::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    reading_diary_server::inner_main(Cli::parse()).await
}
