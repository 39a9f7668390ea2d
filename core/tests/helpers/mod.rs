//! Test helper modules for integration tests

pub mod remote;
pub mod store;

pub use remote::*;
pub use store::*;
