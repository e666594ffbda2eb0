//! Logical key namespaces
//!
//! ```text
//! {prefix}task:{id}      TaskRecord     (task TTL)
//! {prefix}lease:{id}     LeaseRecord    (lease TTL)
//! {prefix}result:{id}    ResultRecord   (result TTL)
//! {prefix}task-index     IndexSnapshot  (snapshot TTL)
//! ```
//!
//! `task-index` does not start with `task:`, so listing the task namespace
//! never returns the snapshot key itself.

use crate::model::TaskId;

const TASK_NAMESPACE: &str = "task:";
const LEASE_NAMESPACE: &str = "lease:";
const RESULT_NAMESPACE: &str = "result:";
const INDEX_KEY: &str = "task-index";

/// Builds and parses store keys for one deployment prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Key space with a deployment prefix, e.g. `"prod:"`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task_prefix(&self) -> String {
        format!("{}{}", self.prefix, TASK_NAMESPACE)
    }

    pub fn lease_prefix(&self) -> String {
        format!("{}{}", self.prefix, LEASE_NAMESPACE)
    }

    pub fn result_prefix(&self) -> String {
        format!("{}{}", self.prefix, RESULT_NAMESPACE)
    }

    pub fn task_key(&self, id: &TaskId) -> String {
        format!("{}{}{}", self.prefix, TASK_NAMESPACE, id)
    }

    pub fn lease_key(&self, id: &TaskId) -> String {
        format!("{}{}{}", self.prefix, LEASE_NAMESPACE, id)
    }

    pub fn result_key(&self, id: &TaskId) -> String {
        format!("{}{}{}", self.prefix, RESULT_NAMESPACE, id)
    }

    pub fn index_key(&self) -> String {
        format!("{}{}", self.prefix, INDEX_KEY)
    }

    /// Extract the task id from a listed `task:` key
    pub fn task_id_from_key(&self, key: &str) -> Option<TaskId> {
        self.id_from_key(key, TASK_NAMESPACE)
    }

    /// Extract the task id from a listed `lease:` key
    pub fn lease_id_from_key(&self, key: &str) -> Option<TaskId> {
        self.id_from_key(key, LEASE_NAMESPACE)
    }

    fn id_from_key(&self, key: &str, namespace: &str) -> Option<TaskId> {
        let id = key.strip_prefix(&self.prefix)?.strip_prefix(namespace)?;
        if id.is_empty() {
            None
        } else {
            Some(TaskId::from_stored(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_without_prefix() {
        let keys = KeySpace::default();
        let id = TaskId::from_stored("abc");

        assert_eq!(keys.task_key(&id), "task:abc");
        assert_eq!(keys.lease_key(&id), "lease:abc");
        assert_eq!(keys.result_key(&id), "result:abc");
        assert_eq!(keys.index_key(), "task-index");
    }

    #[test]
    fn test_keys_with_prefix() {
        let keys = KeySpace::new("prod:");
        let id = TaskId::from_stored("abc");

        assert_eq!(keys.task_key(&id), "prod:task:abc");
        assert_eq!(keys.task_prefix(), "prod:task:");
        assert_eq!(keys.index_key(), "prod:task-index");
    }

    #[test]
    fn test_id_extraction() {
        let keys = KeySpace::new("prod:");

        assert_eq!(
            keys.task_id_from_key("prod:task:t-1"),
            Some(TaskId::from_stored("t-1"))
        );
        assert_eq!(
            keys.lease_id_from_key("prod:lease:t-1"),
            Some(TaskId::from_stored("t-1"))
        );
        // Foreign namespaces and other deployments are ignored
        assert_eq!(keys.task_id_from_key("prod:lease:t-1"), None);
        assert_eq!(keys.task_id_from_key("dev:task:t-1"), None);
        assert_eq!(keys.task_id_from_key("prod:task:"), None);
        assert_eq!(keys.task_id_from_key("prod:task-index"), None);
    }
}
