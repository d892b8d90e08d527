//! Core data types shared across the delivery runtime.

use crate::error::{DeliveryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point in time, in milliseconds since the Unix epoch.
///
/// All controller operations take an explicit `Timestamp` supplied by the
/// caller; the runtime never reads the system clock. Duration accounting is
/// derived entirely from the differences between these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as epoch milliseconds.
    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, clamped at zero.
    ///
    /// Callers may hand us non-monotonic wall-clock readings; elapsed time
    /// never goes negative.
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        (self.0 - earlier.0).max(0) as u64
    }

    /// Returns this timestamp shifted forward by `millis`.
    pub fn plus_millis(self, millis: i64) -> Self {
        Self(self.0 + millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A validated variable/node identifier.
///
/// First character must be a letter or underscore; the rest may also contain
/// digits, hyphens and dots. This is deliberately stricter than free-form
/// strings so identifier sets and plan keys stay unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Creates a validated identifier.
    pub fn new(raw: &str) -> Result<Self> {
        let mut chars = raw.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest =
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !valid_start || !valid_rest {
            return Err(DeliveryError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Base type of a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BaseType {
    /// Boolean true/false.
    Boolean,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Free-form string.
    String,
    /// Identifier-constrained string.
    Identifier,
}

/// Cardinality of a declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    /// Exactly one value (or null).
    Single,
    /// Unordered container of values.
    Multiple,
    /// Ordered container of values.
    Ordered,
}

/// A runtime variable value.
///
/// `Null` is a first-class value: declared variables always have an entry in
/// their state map, initialised to their default or `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    /// The QTI NULL value.
    Null,
    /// Single boolean.
    Boolean(bool),
    /// Single integer.
    Integer(i64),
    /// Single float.
    Float(f64),
    /// Single string.
    String(String),
    /// Single identifier.
    Identifier(Identifier),
    /// Unordered container.
    Multiple(Vec<Value>),
    /// Ordered container.
    Ordered(Vec<Value>),
}

impl Value {
    /// Returns true for the NULL value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Base type of this value, if it is a non-null single.
    pub fn base_type(&self) -> Option<BaseType> {
        match self {
            Value::Boolean(_) => Some(BaseType::Boolean),
            Value::Integer(_) => Some(BaseType::Integer),
            Value::Float(_) => Some(BaseType::Float),
            Value::String(_) => Some(BaseType::String),
            Value::Identifier(_) => Some(BaseType::Identifier),
            _ => None,
        }
    }

    /// Cardinality of this value. `Null` reports `Single`.
    pub fn cardinality(&self) -> Cardinality {
        match self {
            Value::Multiple(_) => Cardinality::Multiple,
            Value::Ordered(_) => Cardinality::Ordered,
            _ => Cardinality::Single,
        }
    }

    /// Interprets this value in a boolean context.
    ///
    /// `Null` and non-boolean values count as false; rule conditions and
    /// preconditions use this coercion.
    pub fn as_bool(&self) -> bool {
        matches!(self, Value::Boolean(true))
    }

    /// Parses a single value of the given base type from candidate input.
    pub fn parse_single(base_type: BaseType, raw: &str) -> Result<Value> {
        let value = match base_type {
            BaseType::Boolean => Value::Boolean(raw.parse::<bool>().map_err(|e| {
                DeliveryError::Expression(format!("cannot parse boolean {raw:?}: {e}"))
            })?),
            BaseType::Integer => Value::Integer(raw.parse::<i64>().map_err(|e| {
                DeliveryError::Expression(format!("cannot parse integer {raw:?}: {e}"))
            })?),
            BaseType::Float => Value::Float(raw.parse::<f64>().map_err(|e| {
                DeliveryError::Expression(format!("cannot parse float {raw:?}: {e}"))
            })?),
            BaseType::String => Value::String(raw.to_string()),
            BaseType::Identifier => Value::Identifier(Identifier::new(raw)?),
        };
        Ok(value)
    }
}

/// Raw candidate response data, as delivered by the hosting application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseData {
    /// One or more strings (form fields, choice identifiers, ...).
    Strings(Vec<String>),
    /// An uploaded file, referenced by path.
    File {
        /// Path to the stored upload.
        path: String,
        /// MIME content type.
        content_type: String,
        /// Original file name.
        file_name: String,
    },
}

impl ResponseData {
    /// Convenience constructor for a single-string response.
    pub fn string(s: &str) -> Self {
        Self::Strings(vec![s.to_string()])
    }

    /// Convenience constructor for a multi-string response.
    pub fn strings(values: &[&str]) -> Self {
        Self::Strings(values.iter().map(|s| s.to_string()).collect())
    }
}

/// Completion status of an item session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// No attempt has been made yet.
    NotAttempted,
    /// Status cannot be determined.
    Unknown,
    /// Responses committed, response processing not yet run.
    PendingProcessing,
    /// Response processing has run for the current attempt.
    Completed,
}

impl Default for CompletionStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Item presentation order within a test part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NavigationMode {
    /// Items are taken strictly in plan order.
    Linear,
    /// Items are freely selectable within the part.
    Nonlinear,
}

/// Response processing schedule within a test part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionMode {
    /// Each item is processed immediately when responses are submitted.
    Individual,
    /// Processing for every item is deferred to the end of the part.
    Simultaneous,
}
