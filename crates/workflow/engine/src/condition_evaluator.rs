//! Condition evaluator: decides `When` and `Until` conditions
//!
//! Conditions are evaluated against the instance variables. Evaluation is
//! pure; it never mutates the variables it reads.

use flowstate_types::ActivityCondition;
use std::collections::BTreeMap;

/// Evaluates activity conditions against instance variables
#[derive(Clone, Debug, Default)]
pub struct ConditionEvaluator;

/// Comparison operators, longest spelling first so `>=` wins over `>`
const OPERATORS: [(&str, Comparison); 6] = [
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    (">=", Comparison::Ge),
    ("<=", Comparison::Le),
    (">", Comparison::Gt),
    ("<", Comparison::Lt),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a condition. Unknown variables make comparisons false.
    pub fn evaluate(
        &self,
        condition: &ActivityCondition,
        variables: &BTreeMap<String, String>,
    ) -> bool {
        match condition {
            ActivityCondition::Constant(value) => *value,
            ActivityCondition::Expression(expression) => {
                let result = self.evaluate_expression(expression, variables);
                tracing::debug!(expression = %expression, result, "Condition evaluated");
                result
            }
        }
    }

    fn evaluate_expression(&self, expression: &str, variables: &BTreeMap<String, String>) -> bool {
        let expression = expression.trim();

        for (symbol, comparison) in OPERATORS {
            if let Some((key, expected)) = expression.split_once(symbol) {
                let key = key.trim();
                let expected = expected.trim().trim_matches('"');
                return match variables.get(key) {
                    Some(actual) => compare(actual, expected, comparison),
                    None => false,
                };
            }
        }

        // Bare boolean variable, optionally negated
        if let Some(name) = expression.strip_prefix('!') {
            return !is_truthy(variables.get(name.trim()));
        }
        is_truthy(variables.get(expression))
    }
}

fn compare(actual: &str, expected: &str, comparison: Comparison) -> bool {
    match comparison {
        Comparison::Eq => actual == expected,
        Comparison::Ne => actual != expected,
        ordered => match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(e)) => match ordered {
                Comparison::Ge => a >= e,
                Comparison::Le => a <= e,
                Comparison::Gt => a > e,
                Comparison::Lt => a < e,
                _ => false,
            },
            _ => false,
        },
    }
}

fn is_truthy(value: Option<&String>) -> bool {
    matches!(value.map(String::as_str), Some("true") | Some("1") | Some("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_constant() {
        let evaluator = ConditionEvaluator::new();
        assert!(evaluator.evaluate(&ActivityCondition::always(), &BTreeMap::new()));
        assert!(!evaluator.evaluate(&ActivityCondition::never(), &BTreeMap::new()));
    }

    #[test]
    fn test_equality() {
        let evaluator = ConditionEvaluator::new();
        let variables = vars(&[("status", "approved")]);
        assert!(evaluator.evaluate(&ActivityCondition::expression("status == approved"), &variables));
        assert!(evaluator.evaluate(
            &ActivityCondition::expression("status == \"approved\""),
            &variables
        ));
        assert!(!evaluator.evaluate(&ActivityCondition::expression("status != approved"), &variables));
        assert!(!evaluator.evaluate(&ActivityCondition::expression("missing == x"), &variables));
    }

    #[test]
    fn test_ordering() {
        let evaluator = ConditionEvaluator::new();
        let variables = vars(&[("count", "3")]);
        assert!(evaluator.evaluate(&ActivityCondition::expression("count >= 3"), &variables));
        assert!(evaluator.evaluate(&ActivityCondition::expression("count > 2"), &variables));
        assert!(evaluator.evaluate(&ActivityCondition::expression("count <= 3"), &variables));
        assert!(!evaluator.evaluate(&ActivityCondition::expression("count < 3"), &variables));
        assert!(!evaluator.evaluate(&ActivityCondition::expression("count > abc"), &variables));
    }

    #[test]
    fn test_boolean_variables() {
        let evaluator = ConditionEvaluator::new();
        let variables = vars(&[("done", "true"), ("open", "false")]);
        assert!(evaluator.evaluate(&ActivityCondition::expression("done"), &variables));
        assert!(!evaluator.evaluate(&ActivityCondition::expression("open"), &variables));
        assert!(evaluator.evaluate(&ActivityCondition::expression("!open"), &variables));
        assert!(evaluator.evaluate(&ActivityCondition::expression("!missing"), &variables));
    }
}
