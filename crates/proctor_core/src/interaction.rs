//! Interaction kinds and their response bind/validate capabilities.
//!
//! Each interaction kind knows how to turn raw candidate input into a typed
//! [`Value`] (`bind`) and how to judge a bound value against its own
//! constraints (`validate`). Bind failures mark the response identifier
//! *unbound*; validation failures mark it *invalid*. Neither is an error:
//! both are reported back as data so the host can redisplay the item.
//!
//! The [`InteractionKind`] enum is the seam where further kinds plug in;
//! choice and text-entry cover the delivery flows exercised here.

use crate::document::VariableDeclaration;
use crate::types::{BaseType, Cardinality, Identifier, ResponseData, Value};
use serde::{Deserialize, Serialize};

/// Why a raw response could not be bound to its declared variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindFailure {
    /// The raw data kind does not fit (e.g. a file where strings are expected).
    UnexpectedDataKind,
    /// The number of supplied strings does not fit the declared cardinality.
    CardinalityMismatch,
    /// A supplied string could not be parsed as the declared base type.
    UnparseableValue(String),
}

/// One interaction within an item body, bound to a response variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    /// The response variable this interaction binds.
    pub response_identifier: Identifier,
    /// Kind-specific data and behavior.
    pub kind: InteractionKind,
}

/// The supported interaction kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    /// Select one or more choices from a fixed set.
    Choice {
        /// The selectable choice identifiers, in presentation order.
        choices: Vec<Identifier>,
        /// Maximum number of selections; 0 means unlimited.
        max_choices: usize,
    },
    /// Free text entry, parsed as the declared base type.
    TextEntry,
}

impl Interaction {
    /// Binds raw response data to a typed value.
    ///
    /// The declaration supplies cardinality and base type; the kind supplies
    /// the parsing behavior.
    pub fn bind(
        &self,
        declaration: &VariableDeclaration,
        raw: &ResponseData,
    ) -> Result<Value, BindFailure> {
        let strings = match raw {
            ResponseData::Strings(strings) => strings,
            ResponseData::File { .. } => return Err(BindFailure::UnexpectedDataKind),
        };
        match declaration.cardinality {
            Cardinality::Single => match strings.as_slice() {
                [] => Ok(Value::Null),
                [single] => self.parse_datum(declaration.base_type, single),
                _ => Err(BindFailure::CardinalityMismatch),
            },
            Cardinality::Multiple | Cardinality::Ordered => {
                let mut values = Vec::with_capacity(strings.len());
                for datum in strings {
                    values.push(self.parse_datum(declaration.base_type, datum)?);
                }
                if values.is_empty() {
                    return Ok(Value::Null);
                }
                Ok(match declaration.cardinality {
                    Cardinality::Multiple => Value::Multiple(values),
                    _ => Value::Ordered(values),
                })
            }
        }
    }

    /// Checks a bound value against the interaction's own constraints.
    pub fn validate(&self, value: &Value) -> bool {
        match &self.kind {
            InteractionKind::Choice {
                choices,
                max_choices,
            } => {
                let selected: Vec<&Identifier> = match value {
                    Value::Null => return true,
                    Value::Identifier(one) => vec![one],
                    Value::Multiple(many) | Value::Ordered(many) => many
                        .iter()
                        .filter_map(|v| match v {
                            Value::Identifier(id) => Some(id),
                            _ => None,
                        })
                        .collect(),
                    _ => return false,
                };
                if *max_choices > 0 && selected.len() > *max_choices {
                    return false;
                }
                selected.iter().all(|id| choices.contains(id))
            }
            InteractionKind::TextEntry => true,
        }
    }

    fn parse_datum(&self, base_type: BaseType, datum: &str) -> Result<Value, BindFailure> {
        Value::parse_single(base_type, datum)
            .map_err(|_| BindFailure::UnparseableValue(datum.to_string()))
    }
}
