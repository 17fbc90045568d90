use clap::Parser;
use ifdns::{App, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    App::run_until_completion(args).await
}
