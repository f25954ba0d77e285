use std::mem;
use std::sync::Arc;

use skiff_server::actor::{ActorContext, ActorHandle};
use skiff_server::ServerBuilder;
use tokio::net::TcpListener;

use crate::driver::actor::DriverActor;
use crate::driver::auth::AuthInterceptor;
use crate::driver::gate::ContextGate;
use crate::driver::gen::driver_service_server::DriverServiceServer;
use crate::driver::server::DriverGrpcService;
use crate::driver::DriverEvent;
use crate::error::{DriverError, DriverResult};
use crate::job::JobCodec;

impl DriverActor {
    pub(super) async fn start_server(&mut self, ctx: &mut ActorContext<Self>) {
        let auth = match AuthInterceptor::new(&self.options().client_id, &self.options().secret) {
            Ok(auth) => auth,
            Err(e) => {
                ctx.send(DriverEvent::StartupFailed {
                    error: format!("invalid RPC credentials: {e}"),
                });
                return;
            }
        };
        let handle = ctx.handle().clone();
        let gate = Arc::clone(&self.options().gate);
        let codec = Arc::clone(&self.options().codec);
        let addr = (
            self.options().listen_host.clone(),
            self.options().listen_port,
        );
        let future = async move {
            let result = Self::serve(handle.clone(), gate, codec, auth, addr).await;
            if let Err(e) = &result {
                let _ = handle
                    .send(DriverEvent::StartupFailed {
                        error: format!("the driver server failed: {e}"),
                    })
                    .await;
            }
            result
        };
        let server = mem::take(&mut self.server);
        self.server = server.start(future).await;
    }

    async fn serve(
        handle: ActorHandle<Self>,
        gate: Arc<ContextGate>,
        codec: Arc<dyn JobCodec>,
        auth: AuthInterceptor,
        addr: (String, u16),
    ) -> DriverResult<()> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let service = DriverServiceServer::with_interceptor(
            DriverGrpcService::new(handle.clone(), gate, codec),
            auth,
        );

        handle
            .send(DriverEvent::ServerReady { port, signal: tx })
            .await
            .map_err(DriverError::from)?;

        ServerBuilder::new("skiff_driver", Default::default())
            .add_service(service, Some(crate::driver::gen::FILE_DESCRIPTOR_SET))
            .await
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .map_err(|e| DriverError::InternalError(e.to_string()))
    }
}
