//! Assertion helpers for flow outcomes.

use std::future::Future;
use std::time::Duration;

use accord_core::{FlowError, FlowException, FlowHandle};
use serde_json::Value;

use crate::error::TestError;

/// Default time a test waits for a flow to finish
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for `handle` to finish within `timeout`
pub async fn await_flow<O>(handle: FlowHandle<O>, timeout: Duration) -> Result<O, TestError>
where
    O: serde::de::DeserializeOwned,
{
    let flow_id = handle.flow_id().clone();
    match tokio::time::timeout(timeout, handle.result()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TestError::Timeout(format!(
            "Flow {} did not finish within {:?}",
            flow_id, timeout
        ))),
    }
}

/// Wait for `handle` to fail and return the protocol exception it failed with.
///
/// # Panics
///
/// Panics if the flow completes, times out, or fails with a non-protocol error.
pub async fn expect_flow_exception<O>(handle: FlowHandle<O>, timeout: Duration) -> FlowException
where
    O: serde::de::DeserializeOwned + std::fmt::Debug,
{
    match await_flow(handle, timeout).await {
        Err(TestError::Flow(FlowError::Protocol(exception))) => exception,
        other => panic!("Expected a protocol exception, got {:?}", other),
    }
}

/// Asserts that `exception` carries `code` and a message containing `fragment`
pub fn assert_exception(exception: &FlowException, code: &str, fragment: &str) {
    assert_eq!(exception.code, code, "unexpected exception code: {}", exception);
    assert!(
        exception.message.contains(fragment),
        "exception message {:?} does not contain {:?}",
        exception.message,
        fragment
    );
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> Result<(), TestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    polled.map_err(|_| TestError::Timeout(format!("Condition not met within {:?}", timeout)))
}

/// Asserts that `data` holds `expected` under `key`
pub fn assert_data_contains(data: &Value, key: &str, expected: Value) {
    match data.get(key) {
        Some(actual) => assert_eq!(*actual, expected, "unexpected value for {}", key),
        None => panic!("missing data key {} in {}", key, data),
    }
}
