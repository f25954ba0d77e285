mod core;
mod handler;
mod rpc;

pub use core::DriverActor;
