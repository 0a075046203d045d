// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use crate::framework::{Code, Status};
use crate::types::FitError;
use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// The snapshot had no nodes at all
    #[error("no nodes available to schedule pods")]
    #[diagnostic(
        code(scheduler::no_nodes_available),
        help("Register at least one node before submitting pods")
    )]
    NoNodesAvailable,

    /// No node passed filtering
    #[error("{0}")]
    #[diagnostic(
        code(scheduler::unschedulable),
        help("Check node resources, taints, ports and pod requirements")
    )]
    Fit(FitError),

    /// A plugin decided the pod cannot run right now (e.g. a Permit rejection)
    #[error("{message}")]
    #[diagnostic(
        code(scheduler::plugin_rejected),
        help("The pod stays pending and is retried after backoff")
    )]
    Unschedulable { message: String },

    /// A plugin failed with an internal error; the message names the phase and plugin
    #[error("{message}")]
    #[diagnostic(
        code(scheduler::plugin_failed),
        help("Inspect the named plugin; the pod stays pending and is retried after backoff")
    )]
    PluginFailed { message: String },

    /// An extender failed
    #[error("running {phase} extender {extender:?}: {message}")]
    #[diagnostic(
        code(scheduler::extender_failed),
        help("Check that the extender is reachable, or mark it ignorable")
    )]
    ExtenderFailed {
        phase: String,
        extender: String,
        message: String,
    },

    /// Node cache rejected an operation
    #[error("cache: {message}")]
    #[diagnostic(
        code(scheduler::cache_error),
        help("The cache and the workload store disagree; the watch sync should converge")
    )]
    CacheError { message: String },

    /// The workload store rejected a request
    #[error("client: {message}")]
    #[diagnostic(
        code(scheduler::client_error),
        help("Check the workload store; the request is retried on the next cycle")
    )]
    ClientError { message: String },

    /// Two profiles share a scheduler name
    #[error("duplicate profile with scheduler name {name:?}")]
    #[diagnostic(
        code(scheduler::duplicate_profile),
        help("Each profile needs a distinct schedulerName")
    )]
    DuplicateProfile { name: String },

    /// An out-of-tree plugin collides with an existing plugin name
    #[error("a plugin named {name:?} already exists")]
    #[diagnostic(
        code(scheduler::plugin_name_conflict),
        help("Rename the out-of-tree plugin, or replace the built-in one explicitly")
    )]
    PluginNameConflict { name: String },

    /// A profile enables a plugin nobody registered
    #[error("plugin {name:?} is not registered")]
    #[diagnostic(
        code(scheduler::unknown_plugin),
        help("Register the plugin in the out-of-tree registry or fix the name")
    )]
    UnknownPlugin { name: String },

    /// Configuration is structurally valid but not usable
    #[error("invalid configuration: {message}")]
    #[diagnostic(code(scheduler::invalid_configuration), help("{suggestion}"))]
    InvalidConfiguration { message: String, suggestion: String },

    /// Legacy policy document is malformed
    #[error("invalid policy: {message}")]
    #[diagnostic(
        code(scheduler::invalid_policy),
        help("Check predicate names and priority weights in the policy document")
    )]
    InvalidPolicy { message: String },

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(code(scheduler::core_error), help("This is an internal error"))]
    CoreError(#[from] berth_core::BerthError),

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError { message: String },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Convert a non-successful plugin status into an error
    pub fn from_status(status: &Status) -> Self {
        match status.code() {
            Code::Unschedulable | Code::UnschedulableAndUnresolvable => Self::Unschedulable {
                message: status.message(),
            },
            _ => Self::PluginFailed {
                message: status.message(),
            },
        }
    }

    /// Whether the failure means "does not fit right now" rather than an internal fault
    pub fn is_unschedulable(&self) -> bool {
        matches!(self, Self::Fit(_) | Self::Unschedulable { .. })
    }

    /// Create an ExtenderFailed error
    pub fn extender_failed(
        phase: impl Into<String>,
        extender: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ExtenderFailed {
            phase: phase.into(),
            extender: extender.into(),
            message: message.into(),
        }
    }

    /// Create a CacheError
    pub fn cache_error(message: impl Into<String>) -> Self {
        Self::CacheError {
            message: message.into(),
        }
    }

    /// Create a ClientError
    pub fn client_error(message: impl Into<String>) -> Self {
        Self::ClientError {
            message: message.into(),
        }
    }

    /// Create an InvalidConfiguration error
    pub fn invalid_configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InvalidPolicy error
    pub fn invalid_policy(message: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            message: message.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

impl From<FitError> for SchedulerError {
    fn from(err: FitError) -> Self {
        Self::Fit(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_failure_displays_phase_message() {
        let status = Status::error("reserve error").with_plugin_context("Reserve", "FakeReserve");
        let err = SchedulerError::from_status(&status);

        assert!(matches!(err, SchedulerError::PluginFailed { .. }));
        assert!(!err.is_unschedulable());
        assert_eq!(
            err.to_string(),
            r#"running Reserve plugin "FakeReserve": reserve error"#
        );
    }

    #[test]
    fn test_unschedulable_status_maps_to_unschedulable() {
        let status = Status::unschedulable("not now").with_plugin_context("Permit", "Gate");
        let err = SchedulerError::from_status(&status);

        assert!(err.is_unschedulable());
        assert_eq!(err.to_string(), r#"running Permit plugin "Gate": not now"#);
    }
}
