use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub driver: DriverConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        let config: Self = Figment::from(Toml::string(DEFAULT_CONFIG))
            .admerge(Env::prefixed("SKIFF__").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot identify the driver to its client.
    pub fn validate(&self) -> CommonResult<()> {
        if self.driver.client_id.is_empty() {
            return Err(CommonError::InvalidArgument(
                "no client ID provided".to_string(),
            ));
        }
        if self.driver.secret.is_empty() {
            return Err(CommonError::InvalidArgument(
                "no secret provided".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// The identifier under which the controlling client knows this driver.
    pub client_id: String,
    /// The shared secret for authenticating the RPC channel.
    pub secret: String,
    pub listen_host: String,
    pub listen_port: u16,
    /// The address of the client callback service.
    pub callback_host: String,
    pub callback_port: u16,
    /// The timeout for outbound RPC futures, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// The number of threads serving inbound RPC requests.
    pub rpc_thread_count: usize,
    /// The session idle timeout in seconds. Zero disables the idle check.
    pub session_idle_timeout_secs: u64,
}
