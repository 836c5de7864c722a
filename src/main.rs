mod api_client;
mod config;
mod data;
mod dates;
mod error;
mod runner;
mod state;

use clap::Parser;
use config::Config;
use log::error;

/// Extracts TikTok Ads integrated reports into per-advertiser CSV slices.
#[derive(Parser)]
struct Args {
    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = runner::run(args.config).await {
        if err.is_user_error() {
            error!("{}", err);
        } else {
            error!("unexpected failure: {:?}", err);
        }
        std::process::exit(err.exit_code());
    }
}
