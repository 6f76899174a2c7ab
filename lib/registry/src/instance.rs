use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A registered service instance.
///
/// Workers carry `name`, `description` and `topic`. Agents additionally
/// carry an `address` and free-form `metadata` (which advertises the topic
/// they service). Instances are owned by the registry session's lease and
/// disappear automatically when the owning process stops renewing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Topic this worker services (WORKER-mode registrations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Network address (agent registrations only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Free-form metadata; agents advertise their topic under `"topic"`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Instance {
    /// The instance key under its service prefix: the address when present
    /// (agents), otherwise the name (workers).
    pub fn id(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// The topic this instance advertises, if any: the explicit `topic`
    /// field for workers, or the `"topic"` metadata entry for agents.
    pub fn advertised_topic(&self) -> Option<&str> {
        self.topic
            .as_deref()
            .or_else(|| self.metadata.get("topic").map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_prefers_address() {
        let mut inst = Instance {
            name: "agent-1".into(),
            description: String::new(),
            topic: None,
            address: Some("10.0.0.5:7100".into()),
            metadata: HashMap::new(),
        };
        assert_eq!(inst.id(), "10.0.0.5:7100");
        inst.address = None;
        assert_eq!(inst.id(), "agent-1");
    }

    #[test]
    fn advertised_topic_from_metadata() {
        let inst = Instance {
            name: "agent-1".into(),
            description: String::new(),
            topic: None,
            address: Some("10.0.0.5:7100".into()),
            metadata: HashMap::from([("topic".to_string(), "t1".to_string())]),
        };
        assert_eq!(inst.advertised_topic(), Some("t1"));
    }

    #[test]
    fn json_roundtrip_skips_empty() {
        let inst = Instance {
            name: "w1".into(),
            description: "shell worker".into(),
            topic: Some("shell".into()),
            address: None,
            metadata: HashMap::new(),
        };
        let json = serde_json::to_string(&inst).unwrap();
        assert!(!json.contains("address"));
        assert!(!json.contains("metadata"));
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
