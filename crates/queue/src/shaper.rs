//! Request shaping
//!
//! Turns a producer payload into a well-formed [`TaskRecord`]. Classification
//! (priority, type, delegation and skill hints) is delegated to a
//! [`Classifier`] supplied by the embedding application; this module only
//! enforces the record contract and rejects anything malformed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::model::{Priority, TaskId, TaskRecord, ValidationError};

/// Raw producer input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub task_type: String,

    pub source: String,

    #[serde(default)]
    pub content: String,

    /// One of low, medium, high, critical; medium when absent
    #[serde(default)]
    pub priority: Option<String>,

    #[serde(default)]
    pub delegation_hints: Vec<String>,

    #[serde(default)]
    pub skill_hints: Vec<String>,

    /// Must be a JSON object when present
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl TaskPayload {
    pub fn new(
        task_type: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            source: source.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_delegation_hint(mut self, hint: impl Into<String>) -> Self {
        self.delegation_hints.push(hint.into());
        self
    }

    pub fn with_skill_hint(mut self, hint: impl Into<String>) -> Self {
        self.skill_hints.push(hint.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Fills in classification fields before validation
///
/// Implementations may set priority, type or hints but must not invent an
/// invalid value: the shaper validates whatever comes out.
pub trait Classifier: Send + Sync {
    fn classify(&self, payload: &mut TaskPayload);
}

/// Leaves the payload exactly as the producer sent it
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughClassifier;

impl Classifier for PassthroughClassifier {
    fn classify(&self, _payload: &mut TaskPayload) {}
}

/// Size bounds enforced on payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaperLimits {
    /// Maximum serialized metadata size in bytes
    pub max_metadata_bytes: usize,
    /// Maximum entries per hint list
    pub max_hints: usize,
}

impl Default for ShaperLimits {
    fn default() -> Self {
        Self {
            max_metadata_bytes: 16 * 1024,
            max_hints: 32,
        }
    }
}

/// Validates payloads into task records
pub struct RequestShaper {
    classifier: Arc<dyn Classifier>,
    limits: ShaperLimits,
    clock: SharedClock,
}

impl RequestShaper {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            classifier: Arc::new(PassthroughClassifier),
            limits: ShaperLimits::default(),
            clock,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_limits(mut self, limits: ShaperLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> ShaperLimits {
        self.limits
    }

    /// Classify and validate a payload
    pub fn shape(&self, mut payload: TaskPayload) -> Result<TaskRecord, ValidationError> {
        self.classifier.classify(&mut payload);

        let id = match payload.id.as_deref() {
            Some(raw) => TaskId::parse(raw)?,
            None => TaskId::generate(),
        };

        if payload.task_type.trim().is_empty() {
            return Err(ValidationError::EmptyField("type"));
        }
        if payload.source.trim().is_empty() {
            return Err(ValidationError::EmptyField("source"));
        }

        let priority = match payload.priority.as_deref() {
            Some(raw) => raw.parse::<Priority>()?,
            None => Priority::default(),
        };

        for (field, hints) in [
            ("delegationHints", &payload.delegation_hints),
            ("skillHints", &payload.skill_hints),
        ] {
            if hints.len() > self.limits.max_hints {
                return Err(ValidationError::TooManyHints {
                    field,
                    count: hints.len(),
                    limit: self.limits.max_hints,
                });
            }
        }

        let metadata = match payload.metadata {
            None | Some(serde_json::Value::Null) => serde_json::Map::new(),
            Some(serde_json::Value::Object(map)) => {
                let size = serde_json::to_vec(&map).map(|v| v.len()).unwrap_or(usize::MAX);
                if size > self.limits.max_metadata_bytes {
                    return Err(ValidationError::MetadataTooLarge {
                        size,
                        limit: self.limits.max_metadata_bytes,
                    });
                }
                map
            }
            Some(_) => return Err(ValidationError::MetadataNotObject),
        };

        Ok(TaskRecord {
            id,
            task_type: payload.task_type,
            source: payload.source,
            content: payload.content,
            priority,
            delegation_hints: payload.delegation_hints,
            skill_hints: payload.skill_hints,
            metadata,
            queued_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use serde_json::json;

    fn shaper() -> RequestShaper {
        RequestShaper::new(system_clock())
    }

    #[test]
    fn test_shape_defaults() {
        let task = shaper()
            .shape(TaskPayload::new("chat_message", "slack", "hi"))
            .unwrap();

        assert_eq!(task.priority, Priority::Medium);
        assert!(!task.id.as_str().is_empty());
        assert!(task.metadata.is_empty());
    }

    #[test]
    fn test_shape_rejects_malformed() {
        let shaper = shaper();
        let base = TaskPayload::new("chat_message", "slack", "hi");

        assert_eq!(
            shaper.shape(TaskPayload::new("", "slack", "hi")),
            Err(ValidationError::EmptyField("type"))
        );
        assert_eq!(
            shaper.shape(TaskPayload::new("t", " ", "hi")),
            Err(ValidationError::EmptyField("source"))
        );
        assert_eq!(
            shaper.shape(base.clone().with_id("")),
            Err(ValidationError::EmptyField("id"))
        );
        assert_eq!(
            shaper.shape(base.clone().with_priority("urgent")),
            Err(ValidationError::InvalidPriority("urgent".to_string()))
        );
        assert_eq!(
            shaper.shape(base.with_metadata(json!(["not", "an", "object"]))),
            Err(ValidationError::MetadataNotObject)
        );
    }

    #[test]
    fn test_shape_enforces_limits() {
        let shaper = shaper().with_limits(ShaperLimits {
            max_metadata_bytes: 32,
            max_hints: 2,
        });

        let too_big = TaskPayload::new("t", "s", "")
            .with_metadata(json!({"blob": "x".repeat(64)}));
        assert!(matches!(
            shaper.shape(too_big),
            Err(ValidationError::MetadataTooLarge { limit: 32, .. })
        ));

        let too_many = TaskPayload::new("t", "s", "")
            .with_skill_hint("a")
            .with_skill_hint("b")
            .with_skill_hint("c");
        assert_eq!(
            shaper.shape(too_many),
            Err(ValidationError::TooManyHints {
                field: "skillHints",
                count: 3,
                limit: 2
            })
        );
    }

    #[test]
    fn test_classifier_runs_before_validation() {
        struct Escalate;
        impl Classifier for Escalate {
            fn classify(&self, payload: &mut TaskPayload) {
                if payload.content.contains("outage") {
                    payload.priority = Some("critical".to_string());
                    payload.delegation_hints.push("oncall".to_string());
                }
            }
        }

        let shaper = shaper().with_classifier(Arc::new(Escalate));
        let task = shaper
            .shape(TaskPayload::new("chat_message", "slack", "prod outage"))
            .unwrap();

        assert_eq!(task.priority, Priority::Critical);
        assert_eq!(task.delegation_hints, vec!["oncall".to_string()]);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload: TaskPayload = serde_json::from_value(json!({
            "type": "repo_change",
            "source": "git",
            "priority": "low",
            "skillHints": ["rust"],
            "metadata": {"repo": "taskrelay"}
        }))
        .unwrap();

        let task = shaper().shape(payload).unwrap();
        assert_eq!(task.task_type, "repo_change");
        assert_eq!(task.skill_hints, vec!["rust".to_string()]);
        assert_eq!(task.metadata["repo"], json!("taskrelay"));
    }
}
