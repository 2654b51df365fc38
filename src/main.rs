use tasbridge::{app, config, logging};

#[tokio::main]
async fn main() {
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = logging::init(cfg.log_level, cfg.log_format) {
        eprintln!("Failed to configure logger: {err}");
        std::process::exit(1);
    }

    if let Err(err) = app::run(cfg).await {
        tracing::error!(error = %format!("{err:#}"), "fatal error");
        std::process::exit(1);
    }
}
