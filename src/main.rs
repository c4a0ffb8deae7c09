use sma_power_flow::config::Config;
use sma_power_flow::coordinator::{Coordinator, CoordinatorSettings};
use sma_power_flow::outputs::{log_publications, ChannelPublisher};
use sma_power_flow::store::JsonFileStore;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting SMA power flow");
    let config = Config::from_env()?;
    info!(
        "Inverter at {}, state in {}",
        config.inverter_address,
        config.state_file.display()
    );

    let (publisher, publications) = ChannelPublisher::new(256);
    tokio::spawn(log_publications(publications));

    let store = JsonFileStore::new(&config.state_file);
    let settings = CoordinatorSettings::from(&config);
    let coordinator = Coordinator::start(settings, Box::new(store), publisher);
    coordinator.wait().await
}
