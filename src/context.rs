use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Type alias for a map of JSON attribute values keyed by attribute name.
///
/// # Examples
/// ```
/// # use flagwise::Attributes;
/// let attributes = [
///     ("plan".to_owned(), "pro".into()),
///     ("seats".to_owned(), 12.into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, serde_json::Value>;

/// Everything known about the request a flag is evaluated for.
///
/// ```
/// # use flagwise::EvaluationContext;
/// let context = EvaluationContext::new("production")
///     .with_user_id("user-42")
///     .with_user_attribute("plan", "pro")
///     .with_custom("app_version", "2.4.1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub environment: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_attributes: Attributes,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: Attributes,
}

impl EvaluationContext {
    /// Create an anonymous context for `environment`.
    pub fn new(environment: impl Into<String>) -> EvaluationContext {
        EvaluationContext {
            user_id: None,
            environment: environment.into(),
            user_attributes: HashMap::new(),
            custom: HashMap::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> EvaluationContext {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> EvaluationContext {
        self.user_attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_custom(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> EvaluationContext {
        self.custom.insert(name.into(), value.into());
        self
    }

    /// Resolve `attribute` by name.
    ///
    /// Built-ins (`user_id`, `environment`) take precedence over `user_attributes`, which take
    /// precedence over `custom`. JSON `null` counts as unresolved.
    pub fn resolve(&self, attribute: &str) -> Option<serde_json::Value> {
        let builtin = match attribute {
            "user_id" => self.user_id.clone().map(serde_json::Value::String),
            "environment" => Some(serde_json::Value::String(self.environment.clone())),
            _ => None,
        };
        builtin
            .or_else(|| self.user_attributes.get(attribute).cloned())
            .or_else(|| self.custom.get(attribute).cloned())
            .filter(|value| !value.is_null())
    }
}
