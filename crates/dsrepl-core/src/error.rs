//! Error types for the replication core.
//!
//! Access-layer errors propagate unchanged through the snapshot builder
//! and reconciler. Only the wait engine converts them into diagnosis
//! instead of aborting.

use thiserror::Error;

use dsrepl_ldap::error::LdapError;

/// Errors surfaced by the snapshot builder, reconciler, and initializer.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Access-layer failure, passed through unchanged.
    #[error(transparent)]
    Ldap(#[from] LdapError),

    /// The replica entry for the suffix does not exist.
    ///
    /// Distinct from a generic not-found: it is the single most common
    /// misconfiguration and carries its own remediation.
    #[error("replication is not enabled for suffix {suffix}")]
    ReplicationDisabled {
        /// Suffix DN that has no replica entry.
        suffix: String,
    },

    /// The caller-supplied desired spec is self-contradictory.
    #[error("invalid agreement spec: {hint}")]
    Validation {
        /// Which field is missing or conflicting.
        hint: String,
    },

    /// The named agreement does not exist under the replica.
    #[error("no agreement named {name} under suffix {suffix}")]
    AgreementNotFound {
        /// Agreement cn that was requested.
        name: String,
        /// Suffix it was looked up under.
        suffix: String,
    },

    /// Total init completed with a nonzero status code.
    #[error("initialization of {agreement} failed: {status}")]
    InitFailed {
        /// Agreement cn.
        agreement: String,
        /// Last observed init status string.
        status: String,
    },

    /// Total init did not complete within the caller's budget.
    #[error("timed out waiting for initialization of {agreement}; last status: {last_status}")]
    InitTimeout {
        /// Agreement cn.
        agreement: String,
        /// Last observed init status string.
        last_status: String,
    },
}

impl ReplError {
    /// Short machine-usable code for this failure class.
    pub fn code(&self) -> &'static str {
        match self {
            ReplError::Ldap(e) => e.code(),
            ReplError::ReplicationDisabled { .. } => "replication-disabled",
            ReplError::Validation { .. } => "validation",
            ReplError::AgreementNotFound { .. } => "agreement-not-found",
            ReplError::InitFailed { .. } => "init-failed",
            ReplError::InitTimeout { .. } => "init-timeout",
        }
    }

    /// Human-actionable remediation hint.
    pub fn remediation(&self) -> String {
        match self {
            ReplError::Ldap(e) => e.remediation(),
            ReplError::ReplicationDisabled { suffix } => {
                format!("enable replication on suffix {suffix} before managing agreements")
            }
            ReplError::Validation { hint } => hint.clone(),
            ReplError::AgreementNotFound { name, suffix } => {
                format!("agreement {name} does not exist under {suffix}; create it first")
            }
            ReplError::InitFailed { status, .. } => {
                format!("total init failed ({status}); check consumer availability and credentials")
            }
            ReplError::InitTimeout { .. } => {
                "total init still running; re-check consumer load and link bandwidth".to_string()
            }
        }
    }

    /// Whether this is a transient access-layer failure worth another poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplError::Ldap(e) if e.is_transient())
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, ReplError>;
