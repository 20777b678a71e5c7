//! Process configuration, parsed once from the CLI at startup and shared
//! read-only by every component that needs it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Segmented memory-mapped WebSocket byte-stream cache server")]
pub struct Config {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// WebSocket upgrade path; any other path gets a 404.
    #[arg(long, default_value = "/audio")]
    pub path: String,

    /// Directory under which per-stream `<streamId>.cache` files live.
    #[arg(long, default_value = "cache")]
    pub cache_dir: PathBuf,

    /// Idle threshold, in seconds, after which a READY or ERROR stream
    /// becomes eligible for the age sweep.
    #[arg(long, default_value_t = 300)]
    pub idle_secs: u64,

    /// Cadence, in seconds, of the background age-sweep task.
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Log level: off, error, warn, info, debug, trace. Falls back to
    /// `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn bind_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn resolved_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.log_level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::parse_from(["audio-cache-server"]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.path, "/audio");
        assert_eq!(cfg.cache_dir, PathBuf::from("cache"));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::parse_from([
            "audio-cache-server",
            "--port",
            "9001",
            "--path",
            "/stream",
            "--cache-dir",
            "/tmp/streams",
        ]);
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.path, "/stream");
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp/streams"));
    }
}
