//! Expression trees and the processing-engine seam.
//!
//! Response processing, outcome processing, branch rules and preconditions
//! all evaluate [`Expression`] trees against a variable environment. The
//! evaluation engine itself is an external collaborator behind the
//! [`ProcessingEngine`] trait; [`Evaluator`] is the compact reference
//! implementation covering the operations the controllers need.

use crate::error::{DeliveryError, Result};
use crate::types::{Identifier, Value};
use serde::{Deserialize, Serialize};

/// Reference to a variable, optionally qualified by an item identifier.
///
/// Unqualified references resolve in the enclosing scope (item variables
/// during item processing, test outcomes during outcome processing).
/// Qualified references (`item.VARIABLE`) resolve against the first plan
/// instance of the named item and are only meaningful at test level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRef {
    /// Item qualifier, if any.
    pub item: Option<Identifier>,
    /// The variable identifier.
    pub identifier: Identifier,
}

impl VariableRef {
    /// An unqualified reference.
    pub fn local(identifier: Identifier) -> Self {
        Self {
            item: None,
            identifier,
        }
    }

    /// An item-qualified reference.
    pub fn in_item(item: Identifier, identifier: Identifier) -> Self {
        Self {
            item: Some(item),
            identifier,
        }
    }
}

/// An expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expression {
    /// A literal value.
    Constant(Value),
    /// A variable lookup.
    Variable(VariableRef),
    /// The declared correct value of a response variable.
    Correct(Identifier),
    /// Equality of two operands; null operands yield null.
    Match(Box<Expression>, Box<Expression>),
    /// Logical conjunction; null operands count as false.
    And(Vec<Expression>),
    /// Logical disjunction; null operands count as false.
    Or(Vec<Expression>),
    /// Logical negation; null counts as false.
    Not(Box<Expression>),
    /// Numeric sum; null operands are skipped.
    Sum(Vec<Expression>),
    /// True iff the operand evaluates to null.
    IsNull(Box<Expression>),
}

impl Expression {
    /// Shorthand for a boolean constant.
    pub fn boolean(value: bool) -> Self {
        Expression::Constant(Value::Boolean(value))
    }

    /// Shorthand for an unqualified variable reference.
    pub fn variable(identifier: Identifier) -> Self {
        Expression::Variable(VariableRef::local(identifier))
    }
}

/// Read access to the variable environment an expression evaluates in.
pub trait VariableLookup {
    /// Resolves a variable reference, `None` if it is not declared here.
    fn lookup(&self, reference: &VariableRef) -> Option<Value>;

    /// Declared correct value of a response variable, if any.
    fn correct_value(&self, identifier: &Identifier) -> Option<Value>;
}

/// The expression-evaluation engine.
///
/// Invoked for response processing, outcome processing, branch-rule
/// conditions and preconditions. Implementations must be pure with respect
/// to the environment: they read variables, never store them.
pub trait ProcessingEngine {
    /// Evaluates an expression tree against a variable environment.
    fn evaluate(&self, expression: &Expression, env: &dyn VariableLookup) -> Result<Value>;
}

/// Reference engine implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Evaluator;

impl ProcessingEngine for Evaluator {
    fn evaluate(&self, expression: &Expression, env: &dyn VariableLookup) -> Result<Value> {
        match expression {
            Expression::Constant(value) => Ok(value.clone()),
            Expression::Variable(reference) => Ok(env.lookup(reference).ok_or_else(|| {
                DeliveryError::Expression(format!(
                    "variable {} is not declared in this scope",
                    reference.identifier
                ))
            })?),
            Expression::Correct(identifier) => {
                Ok(env.correct_value(identifier).unwrap_or(Value::Null))
            }
            Expression::Match(left, right) => {
                let left = self.evaluate(left, env)?;
                let right = self.evaluate(right, env)?;
                if left.is_null() || right.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Boolean(left == right))
                }
            }
            Expression::And(operands) => {
                let mut result = true;
                for operand in operands {
                    result &= self.evaluate(operand, env)?.as_bool();
                }
                Ok(Value::Boolean(result))
            }
            Expression::Or(operands) => {
                let mut result = false;
                for operand in operands {
                    result |= self.evaluate(operand, env)?.as_bool();
                }
                Ok(Value::Boolean(result))
            }
            Expression::Not(operand) => {
                let value = self.evaluate(operand, env)?;
                Ok(Value::Boolean(!value.as_bool()))
            }
            Expression::Sum(operands) => {
                let mut integer_sum: i64 = 0;
                let mut float_sum: f64 = 0.0;
                let mut saw_float = false;
                for operand in operands {
                    match self.evaluate(operand, env)? {
                        Value::Null => {}
                        Value::Integer(i) => integer_sum += i,
                        Value::Float(f) => {
                            saw_float = true;
                            float_sum += f;
                        }
                        other => {
                            return Err(DeliveryError::Expression(format!(
                                "sum over non-numeric operand {other:?}"
                            )));
                        }
                    }
                }
                if saw_float {
                    Ok(Value::Float(float_sum + integer_sum as f64))
                } else {
                    Ok(Value::Integer(integer_sum))
                }
            }
            Expression::IsNull(operand) => {
                let value = self.evaluate(operand, env)?;
                Ok(Value::Boolean(value.is_null()))
            }
        }
    }
}

/// One rule in a template/response/outcome processing block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessingRule {
    /// Assigns the value of `expression` to the declared variable `target`.
    SetValue {
        /// Target variable identifier; routed to the scope it is declared in.
        target: Identifier,
        /// Expression producing the new value.
        expression: Expression,
    },
    /// First branch whose condition holds runs; otherwise the else block.
    Condition {
        /// (condition, rules) pairs, tried in order.
        branches: Vec<(Expression, Vec<ProcessingRule>)>,
        /// Rules to run when no condition holds.
        otherwise: Vec<ProcessingRule>,
    },
    /// Template-processing constraint: a false condition aborts the run and
    /// requests a fresh one.
    TemplateConstraint(Expression),
}

/// Result of running a rule block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// All rules ran.
    Completed,
    /// A template constraint failed; the caller should rerun the block.
    ConstraintFailed,
}

/// Variable environment that can also be written to by `SetValue` rules.
pub trait RuleContext: VariableLookup {
    /// Assigns a value to a declared variable, routed by declaration scope.
    fn set_variable(&mut self, identifier: &Identifier, value: Value) -> Result<()>;
}

/// Runs a rule block to completion or first failed constraint.
pub fn run_rules<C: RuleContext>(
    engine: &dyn ProcessingEngine,
    rules: &[ProcessingRule],
    ctx: &mut C,
) -> Result<RuleOutcome> {
    for rule in rules {
        match rule {
            ProcessingRule::SetValue { target, expression } => {
                let value = engine.evaluate(expression, &*ctx)?;
                ctx.set_variable(target, value)?;
            }
            ProcessingRule::Condition {
                branches,
                otherwise,
            } => {
                let mut taken = false;
                for (condition, block) in branches {
                    if engine.evaluate(condition, &*ctx)?.as_bool() {
                        taken = true;
                        if run_rules(engine, block, ctx)? == RuleOutcome::ConstraintFailed {
                            return Ok(RuleOutcome::ConstraintFailed);
                        }
                        break;
                    }
                }
                if !taken && run_rules(engine, otherwise, ctx)? == RuleOutcome::ConstraintFailed {
                    return Ok(RuleOutcome::ConstraintFailed);
                }
            }
            ProcessingRule::TemplateConstraint(condition) => {
                if !engine.evaluate(condition, &*ctx)?.as_bool() {
                    return Ok(RuleOutcome::ConstraintFailed);
                }
            }
        }
    }
    Ok(RuleOutcome::Completed)
}
