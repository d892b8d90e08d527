//! Session snapshot serialization.
//!
//! Snapshots are plain JSON documents over the session-state data model, not
//! fused into the controllers: deserialize, hand the state back to a
//! controller via `with_state`, and the session continues where it left
//! off. Round-trips are lossless; the e2e suite asserts equality after
//! every scenario.

use crate::error::{DeliveryError, Result};
use crate::session_state::{ItemSessionState, TestSessionState};
use crate::test_plan::TestPlan;
use serde::{Deserialize, Serialize};

/// A restorable test session: the immutable plan plus the mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSessionSnapshot {
    /// The flattened test plan.
    pub test_plan: TestPlan,
    /// The session state at snapshot time.
    pub state: TestSessionState,
}

/// Serializes a standalone item session state.
pub fn serialize_item_session_state(state: &ItemSessionState) -> Result<String> {
    serde_json::to_string_pretty(state)
        .map_err(|e| DeliveryError::Serialization(format!("failed to encode item session: {e}")))
}

/// Deserializes a standalone item session state.
pub fn deserialize_item_session_state(encoded: &str) -> Result<ItemSessionState> {
    serde_json::from_str(encoded)
        .map_err(|e| DeliveryError::Deserialization(format!("failed to decode item session: {e}")))
}

/// Serializes a test session (plan + state).
pub fn serialize_test_session(plan: &TestPlan, state: &TestSessionState) -> Result<String> {
    let snapshot = TestSessionSnapshot {
        test_plan: plan.clone(),
        state: state.clone(),
    };
    serde_json::to_string_pretty(&snapshot)
        .map_err(|e| DeliveryError::Serialization(format!("failed to encode test session: {e}")))
}

/// Deserializes a test session snapshot.
pub fn deserialize_test_session(encoded: &str) -> Result<TestSessionSnapshot> {
    serde_json::from_str(encoded)
        .map_err(|e| DeliveryError::Deserialization(format!("failed to decode test session: {e}")))
}
