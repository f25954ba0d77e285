use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use skiff_common::config::AppConfig;
use skiff_server::actor::ActorSystem;

use crate::driver::actor::DriverActor;
use crate::driver::gate::ContextGate;
use crate::driver::options::DriverOptions;
use crate::driver::protocol::{ClientProtocol, GrpcClientProtocol};
use crate::driver::shutdown::ShutdownCoordinator;
use crate::engine::EngineBuilder;
use crate::error::DriverError;
use crate::job::JobCodec;
use crate::rpc::ClientOptions;

/// Runs the driver until shutdown. Returns an error if startup
/// configuration is invalid or if shutdown was triggered by an error.
pub async fn run_driver(
    config: &AppConfig,
    engine_builder: Arc<dyn EngineBuilder>,
    codec: Arc<dyn JobCodec>,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate().map_err(DriverError::from)?;

    let scratch_dir = tempfile::Builder::new()
        .prefix("skiff-driver-")
        .tempdir()?
        .into_path();
    debug!("using scratch directory {}", scratch_dir.display());

    let shutdown = ShutdownCoordinator::new();
    let gate = Arc::new(ContextGate::new(shutdown.watch_running()));
    let protocol: Arc<dyn ClientProtocol> = Arc::new(GrpcClientProtocol::new(
        ClientOptions {
            enable_tls: false,
            host: config.driver.callback_host.clone(),
            port: config.driver.callback_port,
        },
        &config.driver.client_id,
        &config.driver.secret,
        Duration::from_millis(config.driver.rpc_timeout_ms),
        shutdown.clone(),
    )?);
    let options = DriverOptions::new(
        config,
        scratch_dir.clone(),
        gate,
        engine_builder,
        codec,
        Arc::clone(&protocol),
        shutdown.clone(),
    );

    let mut system = ActorSystem::new();
    let _handle = system.spawn::<DriverActor>(options);

    {
        let shutdown = shutdown.clone();
        let protocol = Arc::clone(&protocol);
        tokio::spawn(async move {
            termination_signal().await;
            if shutdown.is_running() {
                info!("received a termination signal; shutting down the driver");
                let _ = protocol
                    .error_message(
                        "the remote driver was shut down because it received a termination signal",
                    )
                    .await;
                shutdown.trigger(None);
            }
        });
    }

    system.join().await;

    if let Err(e) = tokio::fs::remove_dir_all(&scratch_dir).await {
        warn!(
            "failed to remove scratch directory {}: {e}",
            scratch_dir.display()
        );
    }

    match shutdown.cause() {
        Some(cause) => Err(DriverError::InternalError(cause).into()),
        None => Ok(()),
    }
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = terminate.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
