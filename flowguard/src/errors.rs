//! Error types for the flowguard resilience layer.
//!
//! Item- and stream-level failures are resolved through decisions; what is
//! left over surfaces here. Configuration and capacity problems have their
//! own types so callers can tell them apart from node failures.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for resilient node execution.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The configuration cannot support the requested behavior.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A bounded replay buffer overflowed.
    #[error("{0}")]
    Capacity(#[from] BufferCapacityError),

    /// The node's circuit breaker refused execution.
    #[error("Circuit breaker for node '{node_id}' is open")]
    CircuitOpen {
        /// The node whose breaker is open.
        node_id: String,
        /// The failure that triggered the check, or the refused attempt.
        #[source]
        source: anyhow::Error,
    },

    /// The stream-level handler decided to fail the pipeline.
    #[error("Node '{node_id}' failed")]
    NodeFailed {
        /// The failing node.
        node_id: String,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// Restarts were requested but the restart budget is spent.
    #[error("Node '{node_id}' exhausted its restart budget after {attempts} attempts")]
    RestartsExhausted {
        /// The failing node.
        node_id: String,
        /// Total attempts made, including the first run.
        attempts: u32,
        /// The failure of the last attempt.
        #[source]
        source: anyhow::Error,
    },

    /// Execution was cancelled.
    #[error("Execution cancelled: {0}")]
    Cancelled(String),
}

impl ResilienceError {
    /// Returns the node id the error is attributed to, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::RestartsExhausted { node_id, .. } => Some(node_id),
            Self::Configuration(ConfigurationError::MissingRestartPrerequisite {
                node_id, ..
            }) => Some(node_id),
            Self::Capacity(err) => err.node_id.as_deref(),
            Self::Configuration(_) | Self::Cancelled(_) => None,
        }
    }

    /// Returns true for configuration and capacity errors.
    #[must_use]
    pub fn is_configuration_or_capacity(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Capacity(_))
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Capacity(_) => "BufferCapacityError",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::NodeFailed { .. } => "NodeFailed",
            Self::RestartsExhausted { .. } => "RestartsExhausted",
            Self::Cancelled(_) => "Cancelled",
        };

        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Some(node_id) = self.node_id() {
            map.insert("node_id".to_string(), serde_json::json!(node_id));
        }
        map
    }
}

/// A requirement for `RestartNode` that was not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPrerequisite {
    /// The node must run under the resilient execution wrapper.
    ResilientExecutionStrategy,
    /// `max_node_restart_attempts` must be greater than zero.
    RestartAttempts,
    /// `max_materialized_items` must be bounded.
    BoundedMaterialization,
}

impl RestartPrerequisite {
    /// Hint for fixing the missing prerequisite.
    #[must_use]
    pub fn fix_hint(self) -> &'static str {
        match self {
            Self::ResilientExecutionStrategy => {
                "Wrap the node with ResilientExecutionWrapper to enable restarts."
            }
            Self::RestartAttempts => "Set max_node_restart_attempts to a value above zero.",
            Self::BoundedMaterialization => {
                "Set max_materialized_items so the node input can be replayed."
            }
        }
    }
}

impl fmt::Display for RestartPrerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ResilientExecutionStrategy => "resilient execution strategy",
            Self::RestartAttempts => "max_node_restart_attempts > 0",
            Self::BoundedMaterialization => "bounded max_materialized_items",
        };
        f.write_str(text)
    }
}

/// Errors raised for invalid or insufficient configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// `RestartNode` was decided but a prerequisite is missing.
    #[error("Cannot restart node '{node_id}': missing prerequisite ({prerequisite}). {}", prerequisite.fix_hint())]
    MissingRestartPrerequisite {
        /// The node that asked for a restart.
        node_id: String,
        /// The first missing prerequisite.
        prerequisite: RestartPrerequisite,
    },

    /// A numeric setting is out of range.
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigurationError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a missing restart prerequisite error.
    #[must_use]
    pub fn missing_prerequisite(node_id: impl Into<String>, prerequisite: RestartPrerequisite) -> Self {
        Self::MissingRestartPrerequisite {
            node_id: node_id.into(),
            prerequisite,
        }
    }
}

impl From<serde_json::Error> for ConfigurationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Error raised when appending to a full bounded replay buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Replay buffer capacity of {capacity} items exceeded{}", node_id.as_ref().map(|id| format!(" for node '{id}'")).unwrap_or_default())]
pub struct BufferCapacityError {
    /// The configured capacity.
    pub capacity: usize,
    /// The node owning the buffer, when known.
    pub node_id: Option<String>,
}

impl BufferCapacityError {
    /// Creates a new capacity error.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            node_id: None,
        }
    }

    /// Attributes the error to a node.
    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}
