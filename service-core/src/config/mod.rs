use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Process-level settings shared by every binary in the workspace.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// OTLP collector; tracing stays local when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_sources() {
        let cfg: Config = Cfg::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.otlp_endpoint.is_none());
        assert_eq!(cfg.bind_address(), "0.0.0.0:8080");
    }
}
