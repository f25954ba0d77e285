pub mod actor;
mod builder;

pub use builder::{ServerBuilder, ServerBuilderOptions};
