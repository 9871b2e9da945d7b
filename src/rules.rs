use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{context::ContextAttributes, model::Constraint};

/// Returns `true` if all `constraints` match `attributes` (logical AND).
///
/// An empty constraint list always matches. A non-empty list never matches an empty context.
pub fn matches_all(constraints: &[Constraint], attributes: &ContextAttributes) -> bool {
    if constraints.is_empty() {
        return true;
    }
    if attributes.is_empty() {
        return false;
    }
    constraints
        .iter()
        .all(|constraint| constraint.eval(attributes))
}

impl Constraint {
    pub fn eval(&self, attributes: &ContextAttributes) -> bool {
        self.operator
            .eval(attributes.get(&self.property).map(String::as_str), &self.value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Ereg,
    Nereg,
    In,
    NotIn,
    Contains,
    NotContains,
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the property is missing, the operator
    /// cannot be applied or there's a misconfiguration.
    pub fn eval(&self, attribute: Option<&str>, constraint_value: &str) -> bool {
        self.try_eval(attribute, constraint_value).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(&self, attribute: Option<&str>, constraint_value: &str) -> Option<bool> {
        // Missing property fails every operator, negated ones included.
        let attribute = attribute?;

        match self {
            Self::Eq => Some(attribute == constraint_value),
            Self::Neq => Some(attribute != constraint_value),

            Self::Lt | Self::Lte | Self::Gt | Self::Gte => {
                let attribute: f64 = attribute.trim().parse().ok()?;
                let constraint_value: f64 = constraint_value.trim().parse().ok()?;
                Some(match self {
                    Self::Lt => attribute < constraint_value,
                    Self::Lte => attribute <= constraint_value,
                    Self::Gt => attribute > constraint_value,
                    Self::Gte => attribute >= constraint_value,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            Self::Ereg | Self::Nereg => {
                // The pattern must match the whole value.
                let regex = Regex::new(&format!("^(?:{constraint_value})$")).ok()?;
                let matches = regex.is_match(attribute);
                Some(if *self == Self::Ereg {
                    matches
                } else {
                    !matches
                })
            }

            Self::In | Self::NotIn => {
                let is_in = constraint_value
                    .split(',')
                    .any(|value| value.trim() == attribute);
                Some(if *self == Self::In { is_in } else { !is_in })
            }

            Self::Contains | Self::NotContains => {
                let contains = attribute.contains(constraint_value);
                Some(if *self == Self::Contains {
                    contains
                } else {
                    !contains
                })
            }
        }
    }
}
