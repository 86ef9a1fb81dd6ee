// udmi-test-utils: Shared test utilities for device transport tests.
//
// Provides a mock WebSocket bridge server that records device frames and
// can push config/commands frames back.

pub mod mock_bridge_server;

pub use mock_bridge_server::{MockBridgeServer, ReceivedFrame};
