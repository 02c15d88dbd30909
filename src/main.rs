use clap::Parser;

use event_mesh::config::ReplicaConfig;
use event_mesh::log;
use event_mesh::replica::Replica;

/// Replicated event-registration server.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the JSON configuration file shared by every replica.
    config: std::path::PathBuf,

    /// Index of this replica in the configuration's server list.
    #[arg(long, default_value_t = 0)]
    id: u32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ReplicaConfig::load(&cli.config, cli.id) {
        Ok(config) => config,
        Err(error) => {
            log::error(&format!("Couldn't load the configuration: {error}"));
            std::process::exit(1);
        }
    };

    let replica = match Replica::start(config).await {
        Ok(replica) => replica,
        Err(error) => {
            log::error(&format!("Couldn't start the replica: {error}"));
            std::process::exit(1);
        }
    };

    if tokio::signal::ctrl_c().await.is_ok() {
        replica.stop();
    }
}
