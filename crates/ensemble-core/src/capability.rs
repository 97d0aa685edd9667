use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named ability an agent claims to have, used for eligibility matching.
///
/// Capabilities may arrive at the boundary as bare names or as full records;
/// both normalize to this single representation so internal code never
/// branches on runtime shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Name used for matching. Unique within an agent's capability set.
    pub name: String,
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form parameters attached to the capability.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl Capability {
    /// Create a capability with the given name and no description or
    /// parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: HashMap::new(),
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a single parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_bare_name() {
        let cap: Capability = "research".into();
        assert_eq!(cap.name, "research");
        assert!(cap.description.is_none());
        assert!(cap.parameters.is_empty());
    }

    #[test]
    fn test_builder() {
        let cap = Capability::new("writing")
            .with_description("Long-form text generation")
            .with_parameter("max_words", json!(2000));
        assert_eq!(cap.description.as_deref(), Some("Long-form text generation"));
        assert_eq!(cap.parameters["max_words"], json!(2000));
    }

    #[test]
    fn test_serde_skips_empty_fields() {
        let cap = Capability::new("analysis");
        let json = serde_json::to_string(&cap).unwrap();
        assert!(!json.contains("description"));
        assert!(!json.contains("parameters"));

        let parsed: Capability = serde_json::from_str(r#"{"name":"analysis"}"#).unwrap();
        assert_eq!(parsed, cap);
    }
}
