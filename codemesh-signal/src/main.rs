use codemesh_signal::{SignalConfig, SignalServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match SignalConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };

    log::info!("Starting codemesh signal server on {}", config.bind_addr);
    if let Err(e) = SignalServer::new(config).run().await {
        log::error!("Signal server stopped: {e}");
        std::process::exit(1);
    }
}
