use accord_core::{CoreError, FlowError};
use thiserror::Error;

/// Error types for the test utilities
#[derive(Debug, Error)]
pub enum TestError {
    /// Engine or storage error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// A flow finished with an error
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Test setup failed
    #[error("Test setup failed: {0}")]
    TestSetupFailed(String),
}
