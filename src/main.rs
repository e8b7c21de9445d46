use log::{error, info};
use service::{config::Config, logging::Logger, AppState};

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting streaming platform [{}]", config.runtime_env());

    let principals = match service::init_principals(&config) {
        Ok(principals) => principals,
        Err(e) => {
            error!("Failed to load principals: {e}");
            std::process::exit(1);
        }
    };

    let broker = service::init_broker(&config).await;
    let app_state = AppState::new(config, broker, principals);

    if let Err(e) = web::init_server(app_state).await {
        error!("Server exited with error: {e}");
        std::process::exit(1);
    }
}
