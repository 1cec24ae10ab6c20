use anyhow::Result;
use clap::Parser;
use rustdialer::app::AppStateBuilder;
use rustdialer::config::{Cli, Config};
use std::fs::File;
use tokio::select;
use tracing::{info, level_filters::LevelFilter, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = cli
        .conf
        .map(|conf| match Config::load(&conf) {
            Ok(config) => config,
            Err(e) => {
                warn!("failed to load config {}: {}, using defaults", conf, e);
                Config::default()
            }
        })
        .unwrap_or_default();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let app = AppStateBuilder::new()
        .config(config)
        .build()
        .await
        .expect("Failed to build app");

    info!(
        "Starting rustdialer {} on {}",
        rustdialer::version::get_short_version(),
        app.config.http_addr
    );
    select! {
        _ = app.clone().serve() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
            app.stop();
        }
    }
    Ok(())
}
