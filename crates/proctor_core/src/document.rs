//! In-memory assessment document model.
//!
//! This is the read-only surface the controllers consume. Producing it —
//! parsing and validating assessment markup, applying shuffle and selection
//! — is the job of an external front end; by the time a document reaches a
//! controller its structure is assumed valid and final.

use crate::expression::{Expression, ProcessingRule};
use crate::interaction::Interaction;
use crate::types::{BaseType, Cardinality, Identifier, NavigationMode, SubmissionMode, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A declared template, response or outcome variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    /// Variable identifier, unique within its item or test.
    pub identifier: Identifier,
    /// Declared cardinality.
    pub cardinality: Cardinality,
    /// Declared base type.
    pub base_type: BaseType,
    /// Initial value; variables without one initialize to null.
    #[serde(default)]
    pub default_value: Option<Value>,
    /// Correct value, for response declarations that have one.
    #[serde(default)]
    pub correct_value: Option<Value>,
}

impl VariableDeclaration {
    /// The value this variable holds right after initialization.
    pub fn initial_value(&self) -> Value {
        self.default_value.clone().unwrap_or(Value::Null)
    }
}

/// A single assessment item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDocument {
    /// Item identifier.
    pub identifier: Identifier,
    /// Human-readable title.
    pub title: String,
    /// Adaptive items keep their outcome values across attempts.
    #[serde(default)]
    pub adaptive: bool,
    /// Declared template variables.
    #[serde(default)]
    pub template_declarations: Vec<VariableDeclaration>,
    /// Declared response variables.
    #[serde(default)]
    pub response_declarations: Vec<VariableDeclaration>,
    /// Declared outcome variables.
    #[serde(default)]
    pub outcome_declarations: Vec<VariableDeclaration>,
    /// Interactions presented by the item body.
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    /// Template processing rules.
    #[serde(default)]
    pub template_rules: Vec<ProcessingRule>,
    /// Response processing rules.
    #[serde(default)]
    pub response_rules: Vec<ProcessingRule>,
}

impl ItemDocument {
    /// Looks up a response declaration.
    pub fn response_declaration(&self, identifier: &Identifier) -> Option<&VariableDeclaration> {
        self.response_declarations
            .iter()
            .find(|d| &d.identifier == identifier)
    }

    /// Looks up any declaration: template, then response, then outcome.
    pub fn variable_declaration(&self, identifier: &Identifier) -> Option<&VariableDeclaration> {
        self.template_declarations
            .iter()
            .chain(&self.response_declarations)
            .chain(&self.outcome_declarations)
            .find(|d| &d.identifier == identifier)
    }

    /// The interaction bound to a response variable, if any.
    pub fn interaction_for(&self, response_identifier: &Identifier) -> Option<&Interaction> {
        self.interactions
            .iter()
            .find(|i| &i.response_identifier == response_identifier)
    }
}

/// Where a taken branch rule redirects traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BranchTarget {
    /// Jump forward to the plan node with this identifier.
    Node(Identifier),
    /// End the enclosing section.
    ExitSection,
    /// End the current test part.
    ExitTestPart,
    /// End the whole test.
    ExitTest,
}

/// A branch rule, evaluated when traversal leaves its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    /// Condition; the rule is taken when this evaluates true.
    pub expression: Expression,
    /// Redirect target.
    pub target: BranchTarget,
}

/// A reference to an item within a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    /// Identifier of this reference within the test.
    pub identifier: Identifier,
    /// Identifier of the item document in [`TestDocument::items`].
    pub item_identifier: Identifier,
    /// Preconditions gating entry, all must hold.
    #[serde(default)]
    pub preconditions: Vec<Expression>,
    /// Branch rules evaluated when the item is left.
    #[serde(default)]
    pub branch_rules: Vec<BranchRule>,
}

/// A child of an assessment section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionPart {
    /// A nested section.
    Section(AssessmentSection),
    /// An item reference.
    ItemRef(ItemRef),
}

/// A section grouping items and nested sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentSection {
    /// Section identifier.
    pub identifier: Identifier,
    /// Preconditions gating entry, all must hold.
    #[serde(default)]
    pub preconditions: Vec<Expression>,
    /// Branch rules evaluated when the section is left.
    #[serde(default)]
    pub branch_rules: Vec<BranchRule>,
    /// Children in presentation order.
    #[serde(default)]
    pub parts: Vec<SectionPart>,
}

/// A test part: the unit carrying navigation and submission modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPart {
    /// Part identifier.
    pub identifier: Identifier,
    /// Linear or nonlinear item navigation.
    pub navigation_mode: NavigationMode,
    /// Individual or simultaneous response submission.
    pub submission_mode: SubmissionMode,
    /// Preconditions gating entry, all must hold.
    #[serde(default)]
    pub preconditions: Vec<Expression>,
    /// Branch rules evaluated when the part is left.
    #[serde(default)]
    pub branch_rules: Vec<BranchRule>,
    /// Top-level sections of the part.
    #[serde(default)]
    pub sections: Vec<AssessmentSection>,
}

/// A whole test: parts, referenced items and test-level outcome processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDocument {
    /// Test identifier.
    pub identifier: Identifier,
    /// Human-readable title.
    pub title: String,
    /// Test parts in presentation order.
    pub test_parts: Vec<TestPart>,
    /// Item documents, keyed by their identifier.
    #[serde(default)]
    pub items: BTreeMap<Identifier, ItemDocument>,
    /// Declared test-level outcome variables.
    #[serde(default)]
    pub outcome_declarations: Vec<VariableDeclaration>,
    /// Outcome processing rules.
    #[serde(default)]
    pub outcome_rules: Vec<ProcessingRule>,
}

impl TestDocument {
    /// Looks up a test-level outcome declaration.
    pub fn outcome_declaration(&self, identifier: &Identifier) -> Option<&VariableDeclaration> {
        self.outcome_declarations
            .iter()
            .find(|d| &d.identifier == identifier)
    }
}
