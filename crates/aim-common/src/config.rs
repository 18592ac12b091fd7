//! Daemon configuration.
//!
//! Layered sources, highest precedence first: environment variables
//! (`AIM_…`), a `.env` file in development, an optional `config.toml`, then
//! built-in defaults.

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global daemon configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call aim_common::config::init() first.")
}

/// Initialize the global configuration once, at daemon startup.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // .env is a development convenience only.
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("daemon.state_dir", "./data")?
        .set_default("daemon.state_file", "state.aim")?
        .set_default("daemon.device_name", "primary")?
        .set_default("transport.bootstrap", Vec::<String>::new())?
        .set_default("transport.publish_timeout_secs", 30)?
        .set_default("limits.notification_backlog", 1024)?
        .set_default("limits.subscriber_buffer", 256)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (AIM_DAEMON__STATE_DIR, AIM_TRANSPORT__BOOTSTRAP, etc.)
        .add_source(
            config::Environment::with_prefix("AIM")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub daemon: DaemonConfig,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Directory holding the encrypted state envelope.
    pub state_dir: String,
    /// File name of the state envelope inside `state_dir`.
    pub state_file: String,
    /// Display name for the primary device created with a fresh identity.
    pub device_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Bootstrap addresses handed to the anonymous transport node.
    pub bootstrap: Vec<String>,
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Events retained by the notification bus for cursor replay.
    pub notification_backlog: usize,
    /// Per-subscriber live buffer before drop-oldest kicks in.
    pub subscriber_buffer: usize,
}
