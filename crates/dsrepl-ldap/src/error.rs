//! Error taxonomy for the LDAP access layer.
//!
//! Every failure carries a short machine-usable code and a human hint.
//! Only connection-level failures are transient; bind rejections and
//! missing entries are surfaced immediately and never retried.

use thiserror::Error;

/// Errors surfaced by the access layer.
#[derive(Debug, Error)]
pub enum LdapError {
    /// DNS, TCP, socket, or timeout failure reaching the server.
    #[error("cannot contact directory server ({target}): {detail}")]
    Connection {
        /// URL or socket path that failed.
        target: String,
        /// Short description of the underlying failure.
        detail: String,
    },

    /// The server rejected the bind.
    #[error("bind rejected (rc={code}): {hint}")]
    Auth {
        /// LDAP result code returned by the server (49 = invalid credentials).
        code: i32,
        /// Truncated server diagnostics.
        hint: String,
    },

    /// The requested entry does not exist.
    #[error("no such entry: {dn}")]
    NotFound {
        /// DN that was searched for.
        dn: String,
    },

    /// The server answered with something we could not interpret.
    #[error("malformed directory response: {reason}")]
    Protocol {
        /// What was unexpected about the response.
        reason: String,
    },

    /// Connection parameters are self-contradictory or incomplete.
    #[error("invalid connection parameters: {hint}")]
    Validation {
        /// Which field is missing or conflicting.
        hint: String,
    },
}

impl LdapError {
    /// Short machine-usable code for this failure class.
    pub fn code(&self) -> &'static str {
        match self {
            LdapError::Connection { .. } => "connection",
            LdapError::Auth { .. } => "auth",
            LdapError::NotFound { .. } => "not-found",
            LdapError::Protocol { .. } => "protocol",
            LdapError::Validation { .. } => "validation",
        }
    }

    /// Whether retrying the same operation can plausibly succeed.
    ///
    /// Auth and not-found failures are deterministic and must not be
    /// retried; only connection-level failures qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, LdapError::Connection { .. })
    }

    /// Human-actionable remediation hint for this failure class.
    pub fn remediation(&self) -> String {
        match self {
            LdapError::Connection { target, .. } => format!(
                "{target}: check network/DNS reachability and that the instance is running"
            ),
            LdapError::Auth { code, .. } => format!(
                "bind failed rc={code}: check credentials and TLS trust material"
            ),
            LdapError::NotFound { dn } => format!("{dn}: entry does not exist"),
            LdapError::Protocol { reason } => format!("unexpected server response: {reason}"),
            LdapError::Validation { hint } => hint.clone(),
        }
    }
}

/// Result alias for access-layer operations.
pub type Result<T> = std::result::Result<T, LdapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_is_transient() {
        let conn = LdapError::Connection {
            target: "ldaps://c1:636".into(),
            detail: "timed out".into(),
        };
        let auth = LdapError::Auth {
            code: 49,
            hint: "invalid credentials".into(),
        };
        let missing = LdapError::NotFound {
            dn: "cn=replica".into(),
        };
        assert!(conn.is_transient());
        assert!(!auth.is_transient());
        assert!(!missing.is_transient());
    }

    #[test]
    fn test_codes_are_stable() {
        let e = LdapError::Protocol {
            reason: "garbage".into(),
        };
        assert_eq!(e.code(), "protocol");
        assert_eq!(
            LdapError::Auth {
                code: 49,
                hint: String::new()
            }
            .code(),
            "auth"
        );
    }
}
