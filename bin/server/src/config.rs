//! Centralized server configuration.
//!
//! Loaded with the `config` crate from, lowest precedence first:
//!
//! - the TOML file named by `FLOWFORGE_CONFIG`, if set
//! - environment variables prefixed `FLOWFORGE__`, with `__` separating
//!   nested keys (`FLOWFORGE__ENGINE__MAX_ATTEMPTS=5`)

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flowforge_engine::EngineConfig;
use flowforge_scheduler::SchedulerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Environment variable naming the optional config file.
pub const CONFIG_FILE_VAR: &str = "FLOWFORGE_CONFIG";

/// Server configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// PostgreSQL connection URL. Without one, state lives in memory.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Base64 of the 32-byte AES-256 key credentials are sealed with.
    pub credential_key: String,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

impl ServerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or if required
    /// configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let file = std::env::var_os(CONFIG_FILE_VAR);
        Self::load(file.as_deref().map(Path::new), None)
    }

    /// Loads configuration from `file` and then the environment.
    ///
    /// `env` replaces the process environment when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or if required
    /// configuration is missing or invalid.
    pub fn load(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix("FLOWFORGE")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }

    /// Decodes the credential key.
    ///
    /// # Errors
    ///
    /// Returns the decode failure if the key is not valid base64.
    pub fn credential_key_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.credential_key.trim())
    }
}
