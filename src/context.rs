use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Context attributes used for constraint matching, already normalized to strings.
pub type ContextAttributes = HashMap<String, String>;

/// A context value as supplied by a caller.
///
/// Constraint operators only ever compare string-encoded values, so `ContextValue` is normalized
/// with [`ContextValue::to_constraint_string`] before it reaches the evaluator.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum ContextValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl ContextValue {
    /// String form compared by constraint operators. `Null` is treated as a missing property.
    ///
    /// Integral numbers render without a fractional part, so `42` and `42.0` both become `"42"`.
    pub fn to_constraint_string(&self) -> Option<String> {
        match self {
            ContextValue::String(s) => Some(s.clone()),
            ContextValue::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                Some((*n as i64).to_string())
            }
            ContextValue::Number(n) => Some(n.to_string()),
            ContextValue::Boolean(b) => Some(b.to_string()),
            ContextValue::Null => None,
        }
    }
}

/// The entity being evaluated and the context its constraints are matched against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityContext {
    /// Required for rollout. An empty id is never rolled in.
    #[serde(rename = "entityID", default)]
    pub entity_id: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    /// Accepts any [`ContextValue`] on the wire. Values are normalized to strings on
    /// deserialization and `null` entries are dropped.
    #[serde(
        rename = "entityContext",
        default,
        deserialize_with = "deserialize_context"
    )]
    pub context: ContextAttributes,
}

fn deserialize_context<'de, D>(deserializer: D) -> Result<ContextAttributes, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values = Option::<HashMap<String, ContextValue>>::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, value)| Some((name, value.to_constraint_string()?)))
        .collect())
}

impl EntityContext {
    pub fn new(entity_id: impl Into<String>) -> Self {
        EntityContext {
            entity_id: entity_id.into(),
            entity_type: None,
            context: HashMap::new(),
        }
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Add a context property. `Null` values are dropped, so they behave as missing properties.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        if let Some(value) = value.into().to_constraint_string() {
            self.context.insert(name.into(), value);
        }
        self
    }

    /// Build a context from caller-supplied dynamic values.
    pub fn from_values(
        entity_id: impl Into<String>,
        entity_type: Option<String>,
        values: HashMap<String, ContextValue>,
    ) -> Self {
        let context = values
            .into_iter()
            .filter_map(|(name, value)| Some((name, value.to_constraint_string()?)))
            .collect();
        EntityContext {
            entity_id: entity_id.into(),
            entity_type,
            context,
        }
    }
}
