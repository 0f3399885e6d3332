//! Retry and restart budgets for pipelines and nodes.

use crate::errors::{ConfigurationError, RestartPrerequisite};
use crate::utils::ensure_positive;
use serde::{Deserialize, Serialize};

/// Retry and restart limits.
///
/// Set once at pipeline-build time and read-only during execution. Node
/// level [`NodeRetryOverrides`] inherit every field they leave unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Retries per item after its first failure.
    pub max_item_retries: u32,
    /// Restarts of a node stream after the first run.
    pub max_node_restart_attempts: u32,
    /// Total runs of a node stream, the first run included.
    pub max_sequential_attempts: u32,
    /// Replay buffer capacity. `None` is unbounded and disables restarts.
    pub max_materialized_items: Option<usize>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_item_retries: 0,
            max_node_restart_attempts: 3,
            max_sequential_attempts: 5,
            max_materialized_items: None,
        }
    }
}

impl RetryOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the item retry limit.
    #[must_use]
    pub fn with_max_item_retries(mut self, retries: u32) -> Self {
        self.max_item_retries = retries;
        self
    }

    /// Sets the node restart limit.
    #[must_use]
    pub fn with_max_node_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_node_restart_attempts = attempts;
        self
    }

    /// Sets the total attempt limit.
    #[must_use]
    pub fn with_max_sequential_attempts(mut self, attempts: u32) -> Self {
        self.max_sequential_attempts = attempts;
        self
    }

    /// Bounds the replay buffer.
    #[must_use]
    pub fn with_max_materialized_items(mut self, items: usize) -> Self {
        self.max_materialized_items = Some(items);
        self
    }

    /// Removes the replay buffer bound.
    #[must_use]
    pub fn unbounded_materialization(mut self) -> Self {
        self.max_materialized_items = None;
        self
    }

    /// Applies node-level overrides, inheriting unset fields.
    #[must_use]
    pub fn with_overrides(&self, overrides: &NodeRetryOverrides) -> Self {
        Self {
            max_item_retries: overrides.max_item_retries.unwrap_or(self.max_item_retries),
            max_node_restart_attempts: overrides
                .max_node_restart_attempts
                .unwrap_or(self.max_node_restart_attempts),
            max_sequential_attempts: overrides
                .max_sequential_attempts
                .unwrap_or(self.max_sequential_attempts),
            max_materialized_items: overrides
                .max_materialized_items
                .or(self.max_materialized_items),
        }
    }

    /// Returns the first option-level restart prerequisite that is missing.
    #[must_use]
    pub fn missing_restart_prerequisite(&self) -> Option<RestartPrerequisite> {
        if self.max_node_restart_attempts == 0 {
            Some(RestartPrerequisite::RestartAttempts)
        } else if self.max_materialized_items.is_none() {
            Some(RestartPrerequisite::BoundedMaterialization)
        } else {
            None
        }
    }

    /// Returns true when the options allow node restarts.
    #[must_use]
    pub fn supports_restart(&self) -> bool {
        self.missing_restart_prerequisite().is_none()
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ensure_positive(
            "max_sequential_attempts",
            usize::try_from(self.max_sequential_attempts).unwrap_or(usize::MAX),
        )?;
        if let Some(items) = self.max_materialized_items {
            ensure_positive("max_materialized_items", items)?;
        }
        Ok(())
    }

    /// Parses options from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

/// Per-node overrides of [`RetryOptions`]; `None` inherits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRetryOverrides {
    /// Overrides `max_item_retries`.
    pub max_item_retries: Option<u32>,
    /// Overrides `max_node_restart_attempts`.
    pub max_node_restart_attempts: Option<u32>,
    /// Overrides `max_sequential_attempts`.
    pub max_sequential_attempts: Option<u32>,
    /// Overrides `max_materialized_items`.
    pub max_materialized_items: Option<usize>,
}

impl NodeRetryOverrides {
    /// Creates empty overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the item retry limit.
    #[must_use]
    pub fn max_item_retries(mut self, retries: u32) -> Self {
        self.max_item_retries = Some(retries);
        self
    }

    /// Overrides the node restart limit.
    #[must_use]
    pub fn max_node_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_node_restart_attempts = Some(attempts);
        self
    }

    /// Overrides the total attempt limit.
    #[must_use]
    pub fn max_sequential_attempts(mut self, attempts: u32) -> Self {
        self.max_sequential_attempts = Some(attempts);
        self
    }

    /// Overrides the replay buffer bound.
    #[must_use]
    pub fn max_materialized_items(mut self, items: usize) -> Self {
        self.max_materialized_items = Some(items);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RetryOptions::default();
        assert_eq!(options.max_item_retries, 0);
        assert_eq!(options.max_node_restart_attempts, 3);
        assert_eq!(options.max_sequential_attempts, 5);
        assert_eq!(options.max_materialized_items, None);
        assert!(!options.supports_restart());
    }

    #[test]
    fn test_overrides_inherit_unset_fields() {
        let pipeline = RetryOptions::new()
            .with_max_item_retries(2)
            .with_max_materialized_items(100);
        let node = pipeline.with_overrides(&NodeRetryOverrides::new().max_item_retries(5));

        assert_eq!(node.max_item_retries, 5);
        assert_eq!(node.max_node_restart_attempts, 3);
        assert_eq!(node.max_materialized_items, Some(100));
    }

    #[test]
    fn test_missing_restart_prerequisites() {
        let options = RetryOptions::new().with_max_node_restart_attempts(0);
        assert_eq!(
            options.missing_restart_prerequisite(),
            Some(RestartPrerequisite::RestartAttempts)
        );

        let options = RetryOptions::new();
        assert_eq!(
            options.missing_restart_prerequisite(),
            Some(RestartPrerequisite::BoundedMaterialization)
        );

        let options = RetryOptions::new().with_max_materialized_items(10);
        assert!(options.supports_restart());
    }

    #[test]
    fn test_validate() {
        assert!(RetryOptions::new().with_max_sequential_attempts(0).validate().is_err());
        assert!(RetryOptions::new().with_max_materialized_items(0).validate().is_err());
        assert!(RetryOptions::new().validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let options = RetryOptions::from_json(r#"{"max_item_retries": 4, "max_materialized_items": 50}"#)
            .unwrap();
        assert_eq!(options.max_item_retries, 4);
        assert_eq!(options.max_sequential_attempts, 5);
        assert_eq!(options.max_materialized_items, Some(50));
    }
}
