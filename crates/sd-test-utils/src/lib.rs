// sd-test-utils: a scriptable mock game server for integration tests.
//
// Each test spins up its own isolated server on a random port, seeds
// table contents, scripts reducer failures, and can kill live sessions
// to exercise reconnect paths.

pub mod mock_server;

pub use mock_server::{MockGameServer, MockServerHandle};
