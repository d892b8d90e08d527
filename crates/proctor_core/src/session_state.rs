//! Mutable per-entity session state records.
//!
//! These are plain data: every field is serializable, and all lifecycle
//! bookkeeping happens through small invariant-keeping methods. The
//! controllers decide *when* a transition is legal; the state types only
//! record it.

use crate::test_plan::{TestPlan, TestPlanNodeKey, TestPlanNodeKind};
use crate::types::{CompletionStatus, Identifier, ResponseData, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Lifecycle record shared by item, section, part and test sessions.
///
/// Invariants: `entry_time <= end_time <= exit_time` whenever both sides are
/// defined; `duration_accumulated` grows only while a duration interval is
/// open, and an open interval contributes nothing until it is closed or
/// touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSessionState {
    /// When the candidate entered this node.
    pub entry_time: Option<Timestamp>,
    /// When this node was ended.
    pub end_time: Option<Timestamp>,
    /// When this node was exited.
    pub exit_time: Option<Timestamp>,
    /// Accumulated duration over all closed intervals, in milliseconds.
    pub duration_accumulated: u64,
    /// Start of the currently open duration interval, if any.
    pub duration_interval_start: Option<Timestamp>,
    /// Set when a precondition evaluated false and the node was skipped.
    pub pre_condition_failed: bool,
    /// Set when a branch rule jumped over this node.
    pub jumped_by_branch_rule: bool,
}

impl ControlSessionState {
    /// True once the node has been entered.
    pub fn is_entered(&self) -> bool {
        self.entry_time.is_some()
    }

    /// True once the node has been ended.
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// True once the node has been exited.
    pub fn is_exited(&self) -> bool {
        self.exit_time.is_some()
    }

    /// Entered and not yet ended.
    pub fn is_open(&self) -> bool {
        self.is_entered() && !self.is_ended()
    }

    /// Records entry and opens the duration interval.
    pub fn mark_entered(&mut self, timestamp: Timestamp) {
        self.entry_time = Some(timestamp);
        self.duration_interval_start = Some(timestamp);
    }

    /// Folds the open interval into the accumulator and restarts it at
    /// `timestamp`. No-op once ended or while no interval is open.
    pub fn touch_duration(&mut self, timestamp: Timestamp) {
        if self.is_ended() {
            return;
        }
        if let Some(start) = self.duration_interval_start {
            self.duration_accumulated += timestamp.millis_since(start);
            self.duration_interval_start = Some(timestamp);
        }
    }

    /// Folds the open interval into the accumulator and closes it.
    pub fn close_duration_interval(&mut self, timestamp: Timestamp) {
        if let Some(start) = self.duration_interval_start {
            self.duration_accumulated += timestamp.millis_since(start);
            self.duration_interval_start = None;
        }
    }

    /// Records the end of this node, closing any open interval.
    pub fn mark_ended(&mut self, timestamp: Timestamp) {
        self.close_duration_interval(timestamp);
        self.end_time = Some(timestamp);
    }

    /// Records the exit of this node.
    pub fn mark_exited(&mut self, timestamp: Timestamp) {
        self.exit_time = Some(timestamp);
    }
}

/// Session state of a single item attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemSessionState {
    /// Shared lifecycle record.
    pub control: ControlSessionState,
    /// Set while the session is suspended; only valid while entered and not
    /// yet ended.
    pub suspend_time: Option<Timestamp>,
    /// True once template processing has run.
    pub template_processed: bool,
    /// True once any responses have been bound this session.
    pub responded: bool,
    /// Completion status of the attempt.
    pub completion_status: CompletionStatus,
    /// Number of committed attempts.
    pub num_attempts: u32,
    /// Template variable values.
    pub template_values: BTreeMap<Identifier, Value>,
    /// Committed (authoritative) response values.
    pub response_values: BTreeMap<Identifier, Value>,
    /// Bound-but-uncommitted response values.
    pub uncommitted_response_values: BTreeMap<Identifier, Value>,
    /// Outcome variable values.
    pub outcome_values: BTreeMap<Identifier, Value>,
    /// Raw response data as last submitted, kept for redisplay.
    pub raw_response_data: BTreeMap<Identifier, ResponseData>,
    /// Identifiers whose raw data could not be bound.
    pub unbound_response_identifiers: BTreeSet<Identifier>,
    /// Identifiers whose bound value failed validation.
    pub invalid_response_identifiers: BTreeSet<Identifier>,
    /// Candidate comment, if the item allows one.
    pub candidate_comment: Option<String>,
}

impl ItemSessionState {
    /// True while the session is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspend_time.is_some()
    }

    /// Entered, not ended and not suspended: the candidate can interact.
    pub fn is_interacting(&self) -> bool {
        self.control.is_open() && !self.is_suspended()
    }

    /// Looks up a variable: template, then committed response, then outcome.
    pub fn variable_value(&self, identifier: &Identifier) -> Option<Value> {
        self.template_values
            .get(identifier)
            .or_else(|| self.response_values.get(identifier))
            .or_else(|| self.outcome_values.get(identifier))
            .cloned()
    }

    /// Committed response value.
    pub fn response_value(&self, identifier: &Identifier) -> Option<&Value> {
        self.response_values.get(identifier)
    }

    /// Outcome value.
    pub fn outcome_value(&self, identifier: &Identifier) -> Option<&Value> {
        self.outcome_values.get(identifier)
    }

    /// Template value.
    pub fn template_value(&self, identifier: &Identifier) -> Option<&Value> {
        self.template_values.get(identifier)
    }
}

/// Session state of a whole test attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSessionState {
    /// Stable identifier of this candidate session.
    pub session_id: Uuid,
    /// Shared lifecycle record of the test itself.
    pub control: ControlSessionState,
    /// Key of the test part currently being taken.
    pub current_test_part_key: Option<TestPlanNodeKey>,
    /// Key of the item currently selected.
    pub current_item_key: Option<TestPlanNodeKey>,
    /// Test-level outcome values.
    pub outcome_values: BTreeMap<Identifier, Value>,
    /// Per-part lifecycle records.
    pub test_part_states: BTreeMap<TestPlanNodeKey, ControlSessionState>,
    /// Per-section lifecycle records.
    pub section_states: BTreeMap<TestPlanNodeKey, ControlSessionState>,
    /// Per-item session states.
    pub item_states: BTreeMap<TestPlanNodeKey, ItemSessionState>,
}

impl TestSessionState {
    /// Creates a fresh state with one record per plan node.
    pub fn new(plan: &TestPlan) -> Self {
        let mut test_part_states = BTreeMap::new();
        let mut section_states = BTreeMap::new();
        let mut item_states = BTreeMap::new();
        for node in plan.nodes() {
            match node.kind {
                TestPlanNodeKind::TestPart => {
                    test_part_states.insert(node.key.clone(), ControlSessionState::default());
                }
                TestPlanNodeKind::AssessmentSection => {
                    section_states.insert(node.key.clone(), ControlSessionState::default());
                }
                TestPlanNodeKind::AssessmentItemRef => {
                    item_states.insert(node.key.clone(), ItemSessionState::default());
                }
            }
        }
        Self {
            session_id: Uuid::new_v4(),
            control: ControlSessionState::default(),
            current_test_part_key: None,
            current_item_key: None,
            outcome_values: BTreeMap::new(),
            test_part_states,
            section_states,
            item_states,
        }
    }

    /// Test-level outcome value.
    pub fn outcome_value(&self, identifier: &Identifier) -> Option<&Value> {
        self.outcome_values.get(identifier)
    }

    /// Item session state for a plan node key.
    pub fn item_state(&self, key: &TestPlanNodeKey) -> Option<&ItemSessionState> {
        self.item_states.get(key)
    }

    /// Section lifecycle record for a plan node key.
    pub fn section_state(&self, key: &TestPlanNodeKey) -> Option<&ControlSessionState> {
        self.section_states.get(key)
    }

    /// Part lifecycle record for a plan node key.
    pub fn test_part_state(&self, key: &TestPlanNodeKey) -> Option<&ControlSessionState> {
        self.test_part_states.get(key)
    }
}
