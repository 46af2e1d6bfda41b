use clap::Parser;
use peer_rendezvous_lib::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    let _guard = peer_rendezvous_lib::init_logging(&config)?;

    peer_rendezvous_lib::run(config).await?;
    Ok(())
}
