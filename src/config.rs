//! Process configuration (spec.md §6 "Process surface"). Grounded on the
//! teacher's `env::var(...)` + `.unwrap_or_else`/`.parse()` reads sprinkled
//! through its `main.rs`, collected here into one struct read once at
//! startup instead of scattered across the bootstrap sequence.

use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub master_key_secret: String,
    pub rpc_port: u16,
    pub metrics_enabled: bool,
    pub log_level: String,
    pub tls_ca_cert: Option<PathBuf>,
    pub tls_server_cert: PathBuf,
    pub tls_server_key: PathBuf,
    pub require_client_cert: bool,
    pub amd_vcek_cache_path: Option<PathBuf>,
    pub attestation_mode: crate::attestation::AttestationMode,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            master_key_secret: std::env::var("MASTER_KEY").context("MASTER_KEY is required")?,
            rpc_port: std::env::var("RPC_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(50051),
            metrics_enabled: env_flag("METRICS_ENABLED", false),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            tls_ca_cert: std::env::var("TLS_CA_CERT").ok().map(PathBuf::from),
            tls_server_cert: std::env::var("TLS_SERVER_CERT")
                .context("TLS_SERVER_CERT is required")?
                .into(),
            tls_server_key: std::env::var("TLS_SERVER_KEY")
                .context("TLS_SERVER_KEY is required")?
                .into(),
            require_client_cert: env_flag("REQUIRE_CLIENT_CERT", true),
            amd_vcek_cache_path: std::env::var("AMD_VCEK_CACHE_PATH").ok().map(PathBuf::from),
            attestation_mode: crate::attestation::AttestationMode::from_env(),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()).into(),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sevworker.db")
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_parses_common_truthy_spellings() {
        std::env::set_var("SEVWORKER_TEST_FLAG", "TRUE");
        assert!(env_flag("SEVWORKER_TEST_FLAG", false));
        std::env::set_var("SEVWORKER_TEST_FLAG", "0");
        assert!(!env_flag("SEVWORKER_TEST_FLAG", true));
        std::env::remove_var("SEVWORKER_TEST_FLAG");
        assert!(env_flag("SEVWORKER_TEST_FLAG", true));
    }
}
