//! Proctor Core Library
//!
//! An assessment-delivery session runtime: the state-machine layer that
//! runs standardized test items and tests. It covers:
//! - the entry/suspend/resume/end/exit lifecycle for items and test-level
//!   containers, with caller-supplied timestamps and exact duration
//!   accounting
//! - the bind → commit → process workflow for candidate responses
//! - test-plan traversal with precondition skips and branch-rule jumps,
//!   under every navigation/submission mode combination
//! - lossless session snapshots for suspend-and-resume hosting
//!
//! Parsing assessment markup, the full interaction catalog and the full
//! expression engine are external collaborators; this crate defines their
//! interfaces and ships compact reference implementations sufficient for
//! delivery.
//!
//! # Quick Start
//!
//! ```
//! use proctor_core::{
//!     Evaluator, ItemSessionController, ItemSessionControllerSettings, ItemSessionState,
//!     Identifier, ResponseData, Timestamp, Value,
//! };
//! use proctor_core::{BaseType, Cardinality, ItemDocument, VariableDeclaration};
//! use proctor_core::{Interaction, InteractionKind};
//! use std::collections::BTreeMap;
//!
//! let response = Identifier::new("RESPONSE").unwrap();
//! let item = ItemDocument {
//!     identifier: Identifier::new("example").unwrap(),
//!     title: "Example".to_string(),
//!     adaptive: false,
//!     template_declarations: vec![],
//!     response_declarations: vec![VariableDeclaration {
//!         identifier: response.clone(),
//!         cardinality: Cardinality::Single,
//!         base_type: BaseType::Identifier,
//!         default_value: None,
//!         correct_value: Some(Value::Identifier(Identifier::new("ChoiceA").unwrap())),
//!     }],
//!     outcome_declarations: vec![],
//!     interactions: vec![Interaction {
//!         response_identifier: response.clone(),
//!         kind: InteractionKind::Choice {
//!             choices: vec![
//!                 Identifier::new("ChoiceA").unwrap(),
//!                 Identifier::new("ChoiceB").unwrap(),
//!             ],
//!             max_choices: 1,
//!         },
//!     }],
//!     template_rules: vec![],
//!     response_rules: vec![],
//! };
//!
//! let mut state = ItemSessionState::default();
//! let mut controller = ItemSessionController::new(
//!     &item,
//!     &Evaluator,
//!     ItemSessionControllerSettings::default(),
//!     &mut state,
//! );
//!
//! controller.enter_item(Timestamp::from_millis(0)).unwrap();
//! let mut responses = BTreeMap::new();
//! responses.insert(response, ResponseData::string("ChoiceA"));
//! let all_good = controller
//!     .bind_responses(Timestamp::from_millis(1_000), &responses)
//!     .unwrap();
//! assert!(all_good);
//! ```

mod document;
mod error;
mod expression;
mod interaction;
mod item_controller;
mod persistence;
mod session_state;
mod settings;
mod test_controller;
mod test_plan;
mod types;

pub use document::{
    AssessmentSection, BranchRule, BranchTarget, ItemDocument, ItemRef, SectionPart, TestDocument,
    TestPart, VariableDeclaration,
};
pub use error::{DeliveryError, Result};
pub use expression::{
    run_rules, Evaluator, Expression, ProcessingEngine, ProcessingRule, RuleContext, RuleOutcome,
    VariableLookup, VariableRef,
};
pub use interaction::{BindFailure, Interaction, InteractionKind};
pub use item_controller::ItemSessionController;
pub use persistence::{
    deserialize_item_session_state, deserialize_test_session, serialize_item_session_state,
    serialize_test_session, TestSessionSnapshot,
};
pub use session_state::{ControlSessionState, ItemSessionState, TestSessionState};
pub use settings::{
    DeliverySettings, ItemSessionControllerSettings, TestSessionControllerSettings,
};
pub use test_controller::TestSessionController;
pub use test_plan::{TestPlan, TestPlanNode, TestPlanNodeKey, TestPlanNodeKind, TestPlanner};
pub use types::{
    BaseType, Cardinality, CompletionStatus, Identifier, NavigationMode, ResponseData,
    SubmissionMode, Timestamp, Value,
};
