// ws-test-utils: Shared test utilities for the dispatch engine.
//
// Provides a mock framing collaborator for driving a Server end to end:
// upgrades, inbound frames, outbound frame/close observation with write
// acknowledgement.

pub mod mock_transport;

pub use mock_transport::MockTransport;
