use clap::Parser;
use ssc_p2p::commands::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    ssc_p2p::logger::init(cli.log_level.as_deref());

    if let Err(err) = commands::run(cli).await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}
