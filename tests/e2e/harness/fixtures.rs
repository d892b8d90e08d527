//! Document fixtures for scenario tests.
//!
//! All tests run against variations of one standard choice item: a single
//! choice between ChoiceA/ChoiceB/ChoiceC where ChoiceA scores 1.0, with
//! TP_DONE and RP_DONE marker variables recording that template and
//! response processing actually ran. The test-level SCORE outcome sums the
//! item scores.

use proctor_core::{
    AssessmentSection, BaseType, BranchRule, BranchTarget, Cardinality, Expression, Identifier,
    Interaction, InteractionKind, ItemDocument, ItemRef, NavigationMode, ProcessingEngine,
    ProcessingRule, ResponseData, Result, SectionPart, SubmissionMode, TestDocument, TestPart,
    TestPlanNodeKey, TestSessionController, Timestamp, Value, VariableDeclaration, VariableLookup,
    VariableRef,
};
use std::cell::RefCell;
use std::collections::BTreeMap;

pub fn id(s: &str) -> Identifier {
    Identifier::new(s).unwrap()
}

pub fn ts(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

/// Response map selecting one choice.
pub fn respond(choice: &str) -> BTreeMap<Identifier, ResponseData> {
    let mut map = BTreeMap::new();
    map.insert(id("RESPONSE"), ResponseData::string(choice));
    map
}

/// The standard choice item.
pub fn choice_item(identifier: &str) -> ItemDocument {
    ItemDocument {
        identifier: id(identifier),
        title: format!("Choice item {identifier}"),
        adaptive: false,
        template_declarations: vec![VariableDeclaration {
            identifier: id("TP_DONE"),
            cardinality: Cardinality::Single,
            base_type: BaseType::Boolean,
            default_value: Some(Value::Boolean(false)),
            correct_value: None,
        }],
        response_declarations: vec![VariableDeclaration {
            identifier: id("RESPONSE"),
            cardinality: Cardinality::Single,
            base_type: BaseType::Identifier,
            default_value: None,
            correct_value: Some(Value::Identifier(id("ChoiceA"))),
        }],
        outcome_declarations: vec![
            VariableDeclaration {
                identifier: id("SCORE"),
                cardinality: Cardinality::Single,
                base_type: BaseType::Float,
                default_value: Some(Value::Float(0.0)),
                correct_value: None,
            },
            VariableDeclaration {
                identifier: id("RP_DONE"),
                cardinality: Cardinality::Single,
                base_type: BaseType::Boolean,
                default_value: Some(Value::Boolean(false)),
                correct_value: None,
            },
        ],
        interactions: vec![Interaction {
            response_identifier: id("RESPONSE"),
            kind: InteractionKind::Choice {
                choices: vec![id("ChoiceA"), id("ChoiceB"), id("ChoiceC")],
                max_choices: 1,
            },
        }],
        template_rules: vec![ProcessingRule::SetValue {
            target: id("TP_DONE"),
            expression: Expression::boolean(true),
        }],
        response_rules: vec![
            ProcessingRule::Condition {
                branches: vec![(
                    Expression::Match(
                        Box::new(Expression::variable(id("RESPONSE"))),
                        Box::new(Expression::Correct(id("RESPONSE"))),
                    ),
                    vec![ProcessingRule::SetValue {
                        target: id("SCORE"),
                        expression: Expression::Constant(Value::Float(1.0)),
                    }],
                )],
                otherwise: vec![ProcessingRule::SetValue {
                    target: id("SCORE"),
                    expression: Expression::Constant(Value::Float(0.0)),
                }],
            },
            ProcessingRule::SetValue {
                target: id("RP_DONE"),
                expression: Expression::boolean(true),
            },
        ],
    }
}

/// A plain item reference.
pub fn item_ref(identifier: &str) -> SectionPart {
    SectionPart::ItemRef(ItemRef {
        identifier: id(identifier),
        item_identifier: id(identifier),
        preconditions: vec![],
        branch_rules: vec![],
    })
}

/// An item reference with preconditions and branch rules.
pub fn item_ref_with(
    identifier: &str,
    preconditions: Vec<Expression>,
    branch_rules: Vec<BranchRule>,
) -> SectionPart {
    SectionPart::ItemRef(ItemRef {
        identifier: id(identifier),
        item_identifier: id(identifier),
        preconditions,
        branch_rules,
    })
}

/// A plain section.
pub fn section(identifier: &str, parts: Vec<SectionPart>) -> AssessmentSection {
    AssessmentSection {
        identifier: id(identifier),
        preconditions: vec![],
        branch_rules: vec![],
        parts,
    }
}

/// A section gated by preconditions.
pub fn section_with(
    identifier: &str,
    preconditions: Vec<Expression>,
    parts: Vec<SectionPart>,
) -> AssessmentSection {
    AssessmentSection {
        identifier: id(identifier),
        preconditions,
        branch_rules: vec![],
        parts,
    }
}

/// A plain test part.
pub fn test_part(
    identifier: &str,
    navigation_mode: NavigationMode,
    submission_mode: SubmissionMode,
    sections: Vec<AssessmentSection>,
) -> TestPart {
    TestPart {
        identifier: id(identifier),
        navigation_mode,
        submission_mode,
        preconditions: vec![],
        branch_rules: vec![],
        sections,
    }
}

/// A branch rule that always fires.
pub fn branch_always(target: BranchTarget) -> BranchRule {
    BranchRule {
        expression: Expression::boolean(true),
        target,
    }
}

/// Assembles a test document: every item identifier used by the given parts
/// gets the standard choice item, and the test SCORE sums the item scores.
pub fn test_document(identifier: &str, test_parts: Vec<TestPart>) -> TestDocument {
    let mut items = BTreeMap::new();
    let mut score_operands = Vec::new();
    for part in &test_parts {
        for section in &part.sections {
            collect_items(section, &mut items, &mut score_operands);
        }
    }
    TestDocument {
        identifier: id(identifier),
        title: format!("Test {identifier}"),
        test_parts,
        items,
        outcome_declarations: vec![VariableDeclaration {
            identifier: id("SCORE"),
            cardinality: Cardinality::Single,
            base_type: BaseType::Float,
            default_value: Some(Value::Float(0.0)),
            correct_value: None,
        }],
        outcome_rules: vec![ProcessingRule::SetValue {
            target: id("SCORE"),
            expression: Expression::Sum(score_operands),
        }],
    }
}

fn collect_items(
    section: &AssessmentSection,
    items: &mut BTreeMap<Identifier, ItemDocument>,
    score_operands: &mut Vec<Expression>,
) {
    for part in &section.parts {
        match part {
            SectionPart::Section(nested) => collect_items(nested, items, score_operands),
            SectionPart::ItemRef(item_ref) => {
                items.insert(
                    item_ref.item_identifier.clone(),
                    choice_item(item_ref.item_identifier.as_str()),
                );
                score_operands.push(Expression::Variable(VariableRef::in_item(
                    item_ref.identifier.clone(),
                    id("SCORE"),
                )));
            }
        }
    }
}

/// One part, one section, items i1 and i2.
pub fn two_item_test(
    navigation_mode: NavigationMode,
    submission_mode: SubmissionMode,
) -> TestDocument {
    test_document(
        "simple",
        vec![test_part(
            "p",
            navigation_mode,
            submission_mode,
            vec![section("s", vec![item_ref("i1"), item_ref("i2")])],
        )],
    )
}

/// Plan key of the (first) node carrying `identifier`.
pub fn node_key(controller: &TestSessionController<'_>, identifier: &str) -> TestPlanNodeKey {
    controller
        .test_plan()
        .nodes()
        .find(|node| node.key.identifier().as_str() == identifier)
        .map(|node| node.key.clone())
        .unwrap_or_else(|| panic!("no plan node named {identifier}"))
}

/// Engine wrapper counting evaluations of one watched expression.
///
/// Used to pin down that preconditions are evaluated exactly once, at the
/// moment traversal would otherwise enter the node.
pub struct CountingEngine {
    watched: Expression,
    count: RefCell<u32>,
}

impl CountingEngine {
    pub fn watching(watched: Expression) -> Self {
        Self {
            watched,
            count: RefCell::new(0),
        }
    }

    pub fn evaluations(&self) -> u32 {
        *self.count.borrow()
    }
}

impl ProcessingEngine for CountingEngine {
    fn evaluate(&self, expression: &Expression, env: &dyn VariableLookup) -> Result<Value> {
        if expression == &self.watched {
            *self.count.borrow_mut() += 1;
        }
        proctor_core::Evaluator.evaluate(expression, env)
    }
}
