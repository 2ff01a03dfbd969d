//! Agreement initialization (total init).
//!
//! Triggers a full re-initialization of one consumer by writing
//! `nsds5BeginReplicaRefresh: start` on the agreement entry, then polls
//! the agreement until the refresh clears and the init status reports
//! success. Owns its own loop; a transient read failure mid-poll is
//! logged and the loop continues.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use dsrepl_ldap::client::{escape_filter_value, DirectoryOps, ModifyOp, Scope};
use dsrepl_ldap::error::LdapError;

use crate::error::{ReplError, Result};
use crate::snapshot::{leading_code, replica_dn};

const ATTR_REFRESH: &str = "nsds5BeginReplicaRefresh";
const ATTR_INIT_STATUS: &str = "nsds5replicaLastInitStatus";
const POLL_ATTRS: &[&str] = &[ATTR_REFRESH, ATTR_INIT_STATUS, "nsds5replicaLastInitEnd"];

/// Budgets for one initialization call.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Poll until the init completes (otherwise trigger and return).
    pub wait: bool,
    /// Sleep between status polls.
    pub poll_interval: Duration,
    /// Overall deadline for the init to complete.
    pub timeout: Duration,
    /// Emit a progress line every this many polls (0 disables).
    pub log_every: u32,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            wait: true,
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            log_every: 10,
        }
    }
}

/// Result of a completed (or fire-and-forget) initialization.
#[derive(Debug, Clone, Serialize)]
pub struct InitOutcome {
    /// DN of the initialized agreement.
    pub agreement_dn: String,
    /// Status polls performed.
    pub polls: u32,
    /// Wall-clock seconds spent.
    pub elapsed_seconds: u64,
    /// Last observed init status string.
    pub status: Option<String>,
}

async fn resolve_agreement_dn(
    ops: &dyn DirectoryOps,
    suffix: &str,
    agreement: &str,
) -> Result<String> {
    let base = replica_dn(suffix);
    ops.search_one(&base, Scope::Base, "(objectClass=*)", &["cn"])
        .await
        .map_err(|e| match e {
            LdapError::NotFound { .. } => ReplError::ReplicationDisabled {
                suffix: suffix.to_string(),
            },
            other => ReplError::Ldap(other),
        })?;
    let filter = format!(
        "(&(objectClass=nsDS5ReplicationAgreement)(cn={}))",
        escape_filter_value(agreement)
    );
    let entries = ops.search(&base, Scope::One, &filter, &["cn"]).await?;
    entries
        .into_iter()
        .next()
        .map(|e| e.dn)
        .ok_or_else(|| ReplError::AgreementNotFound {
            name: agreement.to_string(),
            suffix: suffix.to_string(),
        })
}

/// Trigger a total init of `agreement` without waiting for completion.
///
/// Returns the agreement DN the refresh was started on.
pub async fn start_initialization(
    ops: &dyn DirectoryOps,
    suffix: &str,
    agreement: &str,
) -> Result<String> {
    let dn = resolve_agreement_dn(ops, suffix, agreement).await?;
    ops.modify(
        &dn,
        &[ModifyOp::Replace {
            attr: ATTR_REFRESH.to_string(),
            values: vec!["start".to_string()],
        }],
    )
    .await?;
    info!(dn = %dn, "started total init");
    Ok(dn)
}

/// Trigger a total init and poll until it completes.
///
/// Success requires the refresh attribute to clear with an init status
/// code of 0. A nonzero code fails with [`ReplError::InitFailed`]; the
/// deadline fails with [`ReplError::InitTimeout`] carrying the last
/// observed status.
pub async fn initialize(
    ops: &dyn DirectoryOps,
    suffix: &str,
    agreement: &str,
    options: &InitOptions,
) -> Result<InitOutcome> {
    let dn = start_initialization(ops, suffix, agreement).await?;
    if !options.wait {
        return Ok(InitOutcome {
            agreement_dn: dn,
            polls: 0,
            elapsed_seconds: 0,
            status: None,
        });
    }

    let started = Instant::now();
    let mut polls: u32 = 0;
    let mut last_status: Option<String> = None;
    loop {
        polls += 1;
        match ops
            .search_one(&dn, Scope::Base, "(objectClass=*)", POLL_ATTRS)
            .await
        {
            Ok(entry) => {
                let refreshing = entry
                    .first(ATTR_REFRESH)
                    .map(|v| !v.is_empty())
                    .unwrap_or(false);
                last_status = entry.first(ATTR_INIT_STATUS).map(str::to_string);
                let code = last_status.as_deref().and_then(leading_code);
                if !refreshing {
                    match code {
                        Some(0) => {
                            let elapsed = started.elapsed().as_secs();
                            info!(dn = %dn, polls, elapsed_seconds = elapsed, "total init succeeded");
                            return Ok(InitOutcome {
                                agreement_dn: dn,
                                polls,
                                elapsed_seconds: elapsed,
                                status: last_status,
                            });
                        }
                        Some(_) => {
                            return Err(ReplError::InitFailed {
                                agreement: agreement.to_string(),
                                status: last_status.unwrap_or_else(|| "(no status)".into()),
                            })
                        }
                        // Refresh cleared but no status yet; keep polling.
                        None => {}
                    }
                }
            }
            Err(e) if e.is_transient() => {
                warn!(dn = %dn, error = %e, "transient read failure during init poll");
            }
            Err(e) => return Err(e.into()),
        }

        if options.log_every > 0 && polls % options.log_every == 0 {
            info!(
                dn = %dn,
                polls,
                elapsed_s = started.elapsed().as_secs(),
                status = last_status.as_deref().unwrap_or("(none)"),
                "total init in progress"
            );
        }
        if started.elapsed() >= options.timeout {
            return Err(ReplError::InitTimeout {
                agreement: agreement.to_string(),
                last_status: last_status.unwrap_or_else(|| "(no status)".into()),
            });
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dsrepl_ldap::error::Result as LdapResult;
    use dsrepl_ldap::ldif::Entry;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedInitDir {
        agreement_dn: String,
        /// Successive poll responses; the last repeats.
        polls: Vec<Entry>,
        poll_index: Mutex<usize>,
        refresh_writes: Mutex<u32>,
    }

    impl ScriptedInitDir {
        fn new(polls: Vec<Entry>) -> Self {
            Self {
                agreement_dn: format!("cn=agmt to c1:636,{}", replica_dn(SUFFIX)),
                polls,
                poll_index: Mutex::new(0),
                refresh_writes: Mutex::new(0),
            }
        }
    }

    const SUFFIX: &str = "dc=example,dc=com";

    fn poll_entry(refreshing: bool, status: Option<&str>) -> Entry {
        let mut entry = Entry {
            dn: format!("cn=agmt to c1:636,{}", replica_dn(SUFFIX)),
            attrs: HashMap::new(),
        };
        if refreshing {
            entry
                .attrs
                .insert(ATTR_REFRESH.into(), vec!["start".into()]);
        }
        if let Some(s) = status {
            entry.attrs.insert(ATTR_INIT_STATUS.into(), vec![s.into()]);
        }
        entry
    }

    #[async_trait]
    impl DirectoryOps for ScriptedInitDir {
        async fn search_one(
            &self,
            base: &str,
            _scope: Scope,
            _filter: &str,
            _attrs: &[&str],
        ) -> LdapResult<Entry> {
            if base.starts_with("cn=replica,") {
                return Ok(Entry {
                    dn: base.to_string(),
                    attrs: HashMap::new(),
                });
            }
            let mut index = self.poll_index.lock().unwrap();
            let entry = self.polls[(*index).min(self.polls.len() - 1)].clone();
            *index += 1;
            Ok(entry)
        }

        async fn search(
            &self,
            _base: &str,
            _scope: Scope,
            _filter: &str,
            _attrs: &[&str],
        ) -> LdapResult<Vec<Entry>> {
            Ok(vec![Entry {
                dn: self.agreement_dn.clone(),
                attrs: HashMap::new(),
            }])
        }

        async fn add(&self, _dn: &str, _attrs: &[(String, Vec<String>)]) -> LdapResult<()> {
            unreachable!("init never adds entries")
        }

        async fn modify(&self, _dn: &str, changes: &[ModifyOp]) -> LdapResult<()> {
            assert!(changes.iter().any(|c| c.attr() == ATTR_REFRESH));
            *self.refresh_writes.lock().unwrap() += 1;
            Ok(())
        }

        async fn delete(&self, _dn: &str) -> LdapResult<()> {
            unreachable!("init never deletes entries")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_succeeds_after_refresh_clears() {
        let dir = ScriptedInitDir::new(vec![
            poll_entry(true, None),
            poll_entry(true, None),
            poll_entry(false, Some("0 Total init succeeded")),
        ]);
        let outcome = initialize(&dir, SUFFIX, "agmt to c1:636", &InitOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.polls, 3);
        assert_eq!(*dir.refresh_writes.lock().unwrap(), 1);
        assert_eq!(outcome.status.as_deref(), Some("0 Total init succeeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_surfaces_failed_init() {
        let dir = ScriptedInitDir::new(vec![poll_entry(
            false,
            Some("-1 Total init failed: unable to acquire replica"),
        )]);
        let err = initialize(&dir, SUFFIX, "agmt to c1:636", &InitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::InitFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_times_out_while_refreshing() {
        let dir = ScriptedInitDir::new(vec![poll_entry(true, None)]);
        let options = InitOptions {
            timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let err = initialize(&dir, SUFFIX, "agmt to c1:636", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::InitTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_returns_immediately() {
        let dir = ScriptedInitDir::new(vec![]);
        let options = InitOptions {
            wait: false,
            ..Default::default()
        };
        let outcome = initialize(&dir, SUFFIX, "agmt to c1:636", &options)
            .await
            .unwrap();
        assert_eq!(outcome.polls, 0);
        assert_eq!(*dir.refresh_writes.lock().unwrap(), 1);
    }
}
