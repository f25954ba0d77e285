mod application;

pub use application::{AppConfig, DriverConfig};
