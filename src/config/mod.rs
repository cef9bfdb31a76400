// Configuration module entry point
// Loads server, transport and logging settings from file, environment and defaults

mod types;

pub use types::{Config, LoggingConfig, ServerConfig, TransportConfig};

use crate::error::Result;

/// Environment variable prefix, e.g. `RUDP__SERVER__PORT=9100`
pub const ENV_PREFIX: &str = "RUDP";

impl Config {
    /// Load configuration from specified file path (extension optional)
    /// A missing file is not an error; defaults and environment still apply
    pub fn load_from(config_path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 9000)?
            .set_default("server.backlog", 6)?
            .set_default("server.poll_timeout_ms", 100)?
            .set_default("server.read_buffer_units", 8)?
            .set_default("transport.payload_size", 1316)?
            .set_default("transport.connect_timeout_ms", 3000)?
            .set_default("transport.peer_idle_timeout_ms", 5000)?
            .set_default("transport.keepalive_interval_ms", 1000)?
            .set_default("transport.handshake_retry_ms", 250)?
            .set_default("transport.linger_ms", 1000)?
            .set_default("transport.receive_buffer", 8192)?
            .set_default("transport.latency_ms", 120)?
            .set_default("transport.worker_threads", 2)?
            .set_default("logging.level", "info")?
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Default config file is "config.toml" in the working directory
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rudp-config-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_defaults_without_file() {
        let cfg = Config::load_from("/nonexistent/rudp-config").unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.backlog, 6);
        assert_eq!(cfg.server.poll_timeout_ms, 100);
        assert_eq!(cfg.server.read_buffer_units, 8);
        assert_eq!(cfg.transport.payload_size, 1316);
        assert_eq!(cfg.transport.connect_timeout_ms, 3000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = temp_path("file.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[transport]\nlatency_ms = 250\n\n[logging]\nerror_log_file = \"logs/error.log\"\n",
        )
        .unwrap();

        let cfg = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.backlog, 6);
        assert_eq!(cfg.transport.latency_ms, 250);
        assert_eq!(cfg.logging.error_log_file.as_deref(), Some("logs/error.log"));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("RUDP__TRANSPORT__RECEIVE_BUFFER", "64");
        let cfg = Config::load_from("/nonexistent/rudp-config");
        std::env::remove_var("RUDP__TRANSPORT__RECEIVE_BUFFER");

        assert_eq!(cfg.unwrap().transport.receive_buffer, 64);
    }
}
