use clap::Parser;
use mpyboard_lib::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = mpyboard_lib::logging::init_logging(cli.verbose) {
        eprintln!("{}", e);
    }
    if let Err(e) = mpyboard_lib::commands::run(cli).await {
        log::debug!("command failed: {:?}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
