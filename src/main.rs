use clap::Parser;
use log::{error, info};
use mqtt_sensor_exporter::config::{self, Cli, Config};
use mqtt_sensor_exporter::exporter::Exporter;

fn init_logger(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn main() {
    // Load .env file before anything else
    config::load_dotenv();

    let cli = Cli::parse();
    init_logger(cli.debug);
    info!("Starting MQTT sensor exporter");

    let config = Config::from(cli);
    info!("Configuration loaded:");
    info!("  Broker: {}", config.mqtt.broker_address());
    info!("  Client ID: {}", config.mqtt.client_id);
    info!("  Listen: {}", config.exporter.listen_address);
    info!("  HA state prefix: {:?}", config.exporter.ha_state_prefix);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let exporter = Exporter::new(config)?;
        exporter.run().await
    });

    match result {
        Ok(()) => info!("MQTT sensor exporter stopped"),
        Err(e) => {
            error!("MQTT sensor exporter failed: {}", e);
            std::process::exit(1);
        }
    }
}
