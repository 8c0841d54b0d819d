//! Testing utilities for the Accord platform.
//!
//! This crate provides a multi-node harness over the in-memory network,
//! dummy contracts with an upgrade path, and assertion helpers for flow
//! outcomes.

pub mod assertions;
pub mod contracts;
pub mod error;
pub mod mock_network;

pub use assertions::{
    assert_data_contains, assert_exception, await_flow, expect_flow_exception, wait_until,
    DEFAULT_FLOW_TIMEOUT,
};
pub use contracts::{
    dummy_contracts, dummy_state, issue_transaction, DummyContract, DummyContractV2,
    DUMMY_V1_ID, DUMMY_V2_ID,
};
pub use error::TestError;
pub use mock_network::{MockNetwork, MockNode};

/// Install a test subscriber honouring `RUST_LOG`; later calls are no-ops
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
