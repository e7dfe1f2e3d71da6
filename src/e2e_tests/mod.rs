//! End-to-end tests against a scripted server

pub mod mock_server;
pub mod test_context;

// Test scenario modules
pub mod io;
pub mod lifecycle;
pub mod recovery;
pub mod security;

pub use mock_server::{count, MockServer};
pub use test_context::{alice, test_config, TestContext, HOST};
