use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use skiff_common::config::AppConfig;

use crate::driver::gate::ContextGate;
use crate::driver::protocol::ClientProtocol;
use crate::driver::shutdown::ShutdownCoordinator;
use crate::engine::EngineBuilder;
use crate::job::JobCodec;

pub struct DriverOptions {
    pub client_id: String,
    pub secret: String,
    pub listen_host: String,
    pub listen_port: u16,
    /// The timeout applied to outbound RPC futures.
    pub rpc_timeout: Duration,
    /// The session idle timeout; [None] disables the idle check.
    pub session_idle_timeout: Option<Duration>,
    pub scratch_dir: PathBuf,
    pub gate: Arc<ContextGate>,
    pub engine_builder: Arc<dyn EngineBuilder>,
    pub codec: Arc<dyn JobCodec>,
    pub protocol: Arc<dyn ClientProtocol>,
    pub shutdown: ShutdownCoordinator,
}

impl DriverOptions {
    pub fn new(
        config: &AppConfig,
        scratch_dir: PathBuf,
        gate: Arc<ContextGate>,
        engine_builder: Arc<dyn EngineBuilder>,
        codec: Arc<dyn JobCodec>,
        protocol: Arc<dyn ClientProtocol>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            client_id: config.driver.client_id.clone(),
            secret: config.driver.secret.clone(),
            listen_host: config.driver.listen_host.clone(),
            listen_port: config.driver.listen_port,
            rpc_timeout: Duration::from_millis(config.driver.rpc_timeout_ms),
            session_idle_timeout: match config.driver.session_idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            scratch_dir,
            gate,
            engine_builder,
            codec,
            protocol,
            shutdown,
        }
    }
}
