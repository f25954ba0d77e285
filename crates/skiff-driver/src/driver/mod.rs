mod actor;
mod auth;
mod entrypoint;
mod event;
mod gate;
mod options;
mod protocol;
mod runner;
mod server;
mod shutdown;
pub(crate) mod state;
mod tracker;

#[allow(clippy::all)]
pub mod gen {
    tonic::include_proto!("skiff.driver");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("skiff_driver_descriptor");
}

pub use actor::DriverActor;
pub use entrypoint::run_driver;
pub use event::{DriverEvent, JobOutcome};
pub use gate::ContextGate;
pub use options::DriverOptions;
pub use protocol::{ClientProtocol, GrpcClientProtocol};
pub use server::DriverGrpcService;
pub use shutdown::ShutdownCoordinator;
