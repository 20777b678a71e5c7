use std::fs::{self, File};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, Config as LogConfig, TermLogger, TerminalMode, WriteLogger};

use audio_cache_server::config::Config;
use audio_cache_server::pool::MemoryPool;
use audio_cache_server::server::Server;
use audio_cache_server::stream_manager::StreamManager;

fn init_logging(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let level = LevelFilter::from_str(&cfg.resolved_log_level()).unwrap_or(LevelFilter::Info);
    let log_file = File::create(cfg.cache_dir.join("server.log"))?;

    CombinedLogger::init(vec![
        TermLogger::new(level, LogConfig::default(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(level, LogConfig::default(), log_file),
    ])?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = fs::create_dir_all(&config.cache_dir) {
        eprintln!("failed to create cache directory {}: {e}", config.cache_dir.display());
        return ExitCode::FAILURE;
    }

    if let Err(e) = init_logging(&config) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!("audio-cache-server starting");
    info!(
        "config: port={} path={} cache_dir={} idle_secs={} sweep_interval_secs={}",
        config.port,
        config.path,
        config.cache_dir.display(),
        config.idle_secs,
        config.sweep_interval_secs
    );

    let config = Arc::new(config);
    let manager = Arc::new(StreamManager::new(config.cache_dir.clone()));
    let pool = Arc::new(MemoryPool::with_defaults());

    let server = Server::new(config, manager, pool);
    if let Err(e) = server.run().await {
        error!("server terminated: {e}");
        return ExitCode::FAILURE;
    }

    info!("audio-cache-server shut down cleanly");
    ExitCode::SUCCESS
}
