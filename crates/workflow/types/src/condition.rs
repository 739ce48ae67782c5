//! Conditions and variable updates
//!
//! Conditions drive the conditioned activity group (`Until`, per-child
//! `When`) and the replicator (`UntilCondition`). They are evaluated by the
//! engine against the workflow instance variables.

use serde::{Deserialize, Serialize};

/// A declarative condition attached to an activity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityCondition {
    /// A fixed outcome
    Constant(bool),
    /// An expression over instance variables, e.g. `approvals >= 2`
    Expression(String),
}

impl ActivityCondition {
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression(expression.into())
    }

    pub fn always() -> Self {
        Self::Constant(true)
    }

    pub fn never() -> Self {
        Self::Constant(false)
    }
}

/// A change a code activity applies to the instance variables
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableUpdate {
    /// Overwrite a variable
    Set { name: String, value: String },
    /// Add to a numeric variable; a missing or non-numeric value counts as 0
    Increment { name: String, by: i64 },
}

impl VariableUpdate {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn increment(name: impl Into<String>) -> Self {
        Self::Increment {
            name: name.into(),
            by: 1,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Set { name, .. } | Self::Increment { name, .. } => name,
        }
    }

    /// Compute the new value given the current one
    pub fn apply(&self, current: Option<&str>) -> String {
        match self {
            Self::Set { value, .. } => value.clone(),
            Self::Increment { by, .. } => {
                let base = current.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
                (base + by).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_from_missing() {
        let update = VariableUpdate::increment("count");
        assert_eq!(update.apply(None), "1");
        assert_eq!(update.apply(Some("41")), "42");
        assert_eq!(update.apply(Some("abc")), "1");
    }

    #[test]
    fn test_set_overwrites() {
        let update = VariableUpdate::set("status", "approved");
        assert_eq!(update.apply(Some("pending")), "approved");
        assert_eq!(update.name(), "status");
    }
}
