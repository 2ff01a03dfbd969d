//! Status snapshot builder: one read of replica + agreement state.
//!
//! Resolves the replica entry from the suffix by the fixed mapping-tree
//! naming convention, enumerates agreement children, and normalizes raw
//! attributes into the typed model. Performs reads only; safe to call at
//! any frequency.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use dsrepl_ldap::client::{DirectoryOps, LdapClient, Scope};
use dsrepl_ldap::config::LdapConnParams;
use dsrepl_ldap::error::LdapError;
use dsrepl_ldap::ldif::Entry;

use crate::error::{ReplError, Result};
use crate::gentime::parse_generalized_time;
use crate::monitor::{BacklogProbe, DsconfMonitor};
use crate::model::{
    classify, parse_dir_bool, AgreementStatus, ClassifyContext, ReplicaInfo, ReplicationInfo,
    Summary,
};

/// Attributes read for every agreement entry.
pub const AGREEMENT_ATTRS: &[&str] = &[
    "cn",
    "nsds5ReplicaHost",
    "nsds5ReplicaPort",
    "nsds5ReplicaBindDN",
    "nsds5ReplicaEnabled",
    "nsds5replicaLastInitStatus",
    "nsds5replicaLastInitEnd",
    "nsds5replicaLastInitStatusJSON",
    "nsds5replicaLastUpdateStatus",
    "nsds5replicaLastUpdateStart",
    "nsds5replicaLastUpdateEnd",
    "nsds5ReplicaUpdateInProgress",
];

/// Tuning for one snapshot read.
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Keep only agreements whose cn or DN contains one of these tokens.
    pub agreement_filter: Option<Vec<String>>,
    /// Staleness window for the summary, seconds.
    pub stale_seconds: i64,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            agreement_filter: None,
            stale_seconds: 120,
        }
    }
}

/// Escape a suffix DN for embedding as a single RDN value.
pub fn escape_suffix_value(suffix: &str) -> String {
    suffix.replace('=', "\\3D").replace(',', "\\2C")
}

/// Replica entry DN for a suffix, per the fixed mapping-tree convention.
pub fn replica_dn(suffix: &str) -> String {
    format!(
        "cn=replica,cn={},cn=mapping tree,cn=config",
        escape_suffix_value(suffix)
    )
}

/// Leading signed integer of a status string, `None` when unparseable.
pub fn leading_code(status: &str) -> Option<i64> {
    let rest = status.strip_prefix('-').unwrap_or(status);
    let digits: usize = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    status[..status.len() - rest.len() + digits].parse().ok()
}

fn init_label(json_raw: Option<&str>, init_status: Option<&str>, init_code: Option<i64>) -> Option<String> {
    if let Some(raw) = json_raw {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw) {
            if let Some(initialized) = map.get("initialized").and_then(|v| v.as_bool()) {
                return Some(if initialized { "Done" } else { "Unknown" }.to_string());
            }
            if let Some(state) = map.get("state").and_then(|v| v.as_str()) {
                let lower = state.to_ascii_lowercase();
                return Some(match lower.as_str() {
                    "green" | "succeeded" | "success" => "Done".to_string(),
                    other => {
                        let mut chars = other.chars();
                        match chars.next() {
                            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                            None => "Unknown".to_string(),
                        }
                    }
                });
            }
        }
    }
    init_status.map(|_| if init_code == Some(0) { "Done" } else { "Unknown" }.to_string())
}

/// Normalize one agreement entry into the typed model.
pub fn parse_agreement(entry: &Entry) -> AgreementStatus {
    let init_status = entry.first("nsds5replicaLastInitStatus").map(str::to_string);
    let update_status = entry.first("nsds5replicaLastUpdateStatus").map(str::to_string);
    let init_end = entry.first("nsds5replicaLastInitEnd").map(str::to_string);
    let update_start = entry.first("nsds5replicaLastUpdateStart").map(str::to_string);
    let update_end = entry.first("nsds5replicaLastUpdateEnd").map(str::to_string);
    AgreementStatus {
        dn: entry.dn.clone(),
        name: entry.first("cn").map(str::to_string),
        host: entry.first("nsds5ReplicaHost").map(str::to_string),
        port: entry.first("nsds5ReplicaPort").and_then(|p| p.parse().ok()),
        bind_dn: entry.first("nsds5ReplicaBindDN").map(str::to_string),
        enabled: entry.first("nsds5ReplicaEnabled").map(parse_dir_bool),
        busy: entry.first("nsds5ReplicaUpdateInProgress").map(parse_dir_bool),
        last_init_code: init_status.as_deref().and_then(leading_code),
        init_status_label: init_label(
            entry.first("nsds5replicaLastInitStatusJSON"),
            init_status.as_deref(),
            init_status.as_deref().and_then(leading_code),
        ),
        last_init_epoch: init_end.as_deref().and_then(parse_generalized_time),
        last_init_status: init_status,
        last_init_end: init_end,
        last_update_code: update_status.as_deref().and_then(leading_code),
        last_update_status: update_status,
        last_update_start_epoch: update_start.as_deref().and_then(parse_generalized_time),
        last_update_start: update_start,
        last_update_epoch: update_end.as_deref().and_then(parse_generalized_time),
        last_update_end: update_end,
        backlog: None,
        phase: None,
    }
}

/// Aggregate health booleans over a set of observations.
pub fn summarize(
    agreements: &[AgreementStatus],
    stale_seconds: i64,
    now_epoch: i64,
) -> Summary {
    let mut problems: Vec<String> = Vec::new();
    let configured = agreements.iter().any(|a| a.enabled == Some(true));
    if !configured {
        problems.push("No enabled agreements for suffix".to_string());
    }
    let any_busy = agreements.iter().any(|a| a.busy == Some(true));
    let recent_ok = agreements
        .iter()
        .any(|a| a.fresh_success(now_epoch, stale_seconds));
    let working = any_busy || recent_ok;
    if !working && !agreements.is_empty() {
        for a in agreements {
            let name = a.short_name().split(',').next().unwrap_or(a.short_name());
            match (a.last_update_code, a.last_update_epoch) {
                (Some(code), _) if code != 0 => {
                    problems.push(format!("{name}: update failed (code {code})"))
                }
                (_, None) => problems.push(format!("{name}: no update timestamp observed")),
                (_, Some(epoch)) if now_epoch - epoch > stale_seconds => {
                    problems.push(format!("{name}: last update stale >{stale_seconds}s"))
                }
                _ => {}
            }
        }
    }
    let none_busy = !agreements.is_empty() && agreements.iter().all(|a| a.busy != Some(true));
    let init_ok = !agreements.is_empty()
        && agreements
            .iter()
            .all(|a| a.init_ok() || matches!(a.init_status_label.as_deref(), Some("Done" | "Completed")));
    let all_recent = !agreements.is_empty()
        && agreements
            .iter()
            .all(|a| a.fresh_success(now_epoch, stale_seconds));
    let backlog_ok = !agreements.is_empty()
        && agreements
            .iter()
            .all(|a| matches!(a.backlog, None | Some(0)));
    let finished = none_busy && init_ok && all_recent && backlog_ok;

    problems.sort();
    problems.dedup();
    Summary {
        configured,
        working,
        finished,
        problems,
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Read replica and agreement state for a suffix.
///
/// A missing replica entry fails with [`ReplError::ReplicationDisabled`],
/// not a generic not-found. `backlog_by_name` (from a monitor probe) is
/// merged into matching agreements when given. Access-layer errors
/// propagate unchanged.
pub async fn snapshot(
    ops: &dyn DirectoryOps,
    suffix: &str,
    options: &SnapshotOptions,
    backlog_by_name: Option<&HashMap<String, i64>>,
) -> Result<ReplicationInfo> {
    let rdn = replica_dn(suffix);
    let replica_entry = ops
        .search_one(&rdn, Scope::Base, "(objectClass=*)", &["nsds5ReplicaEnabled", "nsds50ruv"])
        .await
        .map_err(|e| match e {
            LdapError::NotFound { .. } => ReplError::ReplicationDisabled {
                suffix: suffix.to_string(),
            },
            other => ReplError::Ldap(other),
        })?;

    let replica = ReplicaInfo {
        dn: rdn.clone(),
        enabled: replica_entry.first("nsds5ReplicaEnabled").map(parse_dir_bool),
        ruv: replica_entry.first("nsds50ruv").map(str::to_string),
    };

    let entries = match ops
        .search(&rdn, Scope::One, "(objectClass=nsDS5ReplicationAgreement)", AGREEMENT_ATTRS)
        .await
    {
        Ok(entries) => entries,
        Err(LdapError::NotFound { .. }) => Vec::new(),
        Err(other) => return Err(ReplError::Ldap(other)),
    };

    let mut warnings = Vec::new();
    let mut agreements: Vec<AgreementStatus> = Vec::new();
    for entry in &entries {
        let mut status = parse_agreement(entry);
        if let Some(map) = backlog_by_name {
            status.backlog = map.get(status.short_name()).copied();
        }
        agreements.push(status);
    }

    if let Some(filter) = &options.agreement_filter {
        for token in filter {
            let lower = token.to_ascii_lowercase();
            let matched = agreements.iter().any(|a| {
                a.name
                    .as_deref()
                    .map(|n| n.to_ascii_lowercase().contains(&lower))
                    .unwrap_or(false)
                    || a.dn.to_ascii_lowercase().contains(&lower)
            });
            if !matched {
                warnings.push(format!("agreement filter '{token}' matched nothing"));
            }
        }
        agreements.retain(|a| {
            filter.iter().any(|token| {
                let lower = token.to_ascii_lowercase();
                a.name
                    .as_deref()
                    .map(|n| n.to_ascii_lowercase().contains(&lower))
                    .unwrap_or(false)
                    || a.dn.to_ascii_lowercase().contains(&lower)
            })
        });
    }

    let now = now_epoch();
    for status in agreements.iter_mut() {
        status.phase = Some(classify(
            status,
            &ClassifyContext {
                now_epoch: now,
                stale_seconds: options.stale_seconds,
                require_init_success: true,
                trending: false,
            },
        ));
    }
    let summary = summarize(&agreements, options.stale_seconds, now);
    debug!(
        suffix,
        agreements = agreements.len(),
        configured = summary.configured,
        working = summary.working,
        finished = summary.finished,
        "snapshot complete"
    );
    Ok(ReplicationInfo {
        replica,
        agreements,
        summary,
        warnings,
    })
}

/// One-shot read with a scoped session and optional backlog probe.
///
/// This is the external "read" operation: it opens a session, samples the
/// `dsconf` monitor when enabled (degrading silently to "backlog
/// unknown"), takes one snapshot, and releases the session.
pub async fn read_replication_info(
    params: &LdapConnParams,
    suffix: &str,
    options: &SnapshotOptions,
    monitor_enabled: bool,
) -> Result<ReplicationInfo> {
    let backlog = if monitor_enabled {
        DsconfMonitor::from_params(params).sample(suffix).await
    } else {
        None
    };
    let client = LdapClient::connect(params.clone()).await?;
    snapshot(&client, suffix, options, backlog.as_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gentime::format_generalized_time;
    use async_trait::async_trait;
    use dsrepl_ldap::client::ModifyOp;
    use dsrepl_ldap::error::Result as LdapResult;

    /// Scripted read-only directory for snapshot tests.
    struct FakeDir {
        replica: Option<Entry>,
        agreements: Vec<Entry>,
    }

    #[async_trait]
    impl DirectoryOps for FakeDir {
        async fn search_one(
            &self,
            base: &str,
            _scope: Scope,
            _filter: &str,
            _attrs: &[&str],
        ) -> LdapResult<Entry> {
            self.replica.clone().ok_or(LdapError::NotFound {
                dn: base.to_string(),
            })
        }

        async fn search(
            &self,
            _base: &str,
            _scope: Scope,
            _filter: &str,
            _attrs: &[&str],
        ) -> LdapResult<Vec<Entry>> {
            Ok(self.agreements.clone())
        }

        async fn add(&self, _dn: &str, _attrs: &[(String, Vec<String>)]) -> LdapResult<()> {
            unreachable!("snapshot must not write")
        }

        async fn modify(&self, _dn: &str, _changes: &[ModifyOp]) -> LdapResult<()> {
            unreachable!("snapshot must not write")
        }

        async fn delete(&self, _dn: &str) -> LdapResult<()> {
            unreachable!("snapshot must not write")
        }
    }

    fn replica_entry() -> Entry {
        let mut e = Entry {
            dn: replica_dn("dc=example,dc=com"),
            ..Default::default()
        };
        e.attrs
            .insert("nsds5ReplicaEnabled".into(), vec!["on".into()]);
        e.attrs.insert(
            "nsds50ruv".into(),
            vec!["{replicageneration} 1234abcd".into()],
        );
        e
    }

    fn agreement_entry(name: &str, update_end_epoch: i64) -> Entry {
        let mut e = Entry {
            dn: format!("cn={name},{}", replica_dn("dc=example,dc=com")),
            ..Default::default()
        };
        e.attrs.insert("cn".into(), vec![name.into()]);
        e.attrs
            .insert("nsds5ReplicaHost".into(), vec!["c1.example.com".into()]);
        e.attrs.insert("nsds5ReplicaPort".into(), vec!["636".into()]);
        e.attrs
            .insert("nsds5ReplicaEnabled".into(), vec!["on".into()]);
        e.attrs
            .insert("nsds5ReplicaUpdateInProgress".into(), vec!["FALSE".into()]);
        e.attrs.insert(
            "nsds5replicaLastInitStatus".into(),
            vec!["0 Total init succeeded".into()],
        );
        e.attrs.insert(
            "nsds5replicaLastUpdateStatus".into(),
            vec!["0 Incremental update succeeded".into()],
        );
        e.attrs.insert(
            "nsds5replicaLastUpdateEnd".into(),
            vec![format_generalized_time(update_end_epoch)],
        );
        e
    }

    #[test]
    fn test_replica_dn_convention() {
        assert_eq!(
            replica_dn("dc=example,dc=com"),
            "cn=replica,cn=dc\\3Dexample\\2Cdc\\3Dcom,cn=mapping tree,cn=config"
        );
    }

    #[test]
    fn test_leading_code() {
        assert_eq!(leading_code("0 Replica acquired successfully"), Some(0));
        assert_eq!(leading_code("-1 Unable to acquire replica"), Some(-1));
        assert_eq!(leading_code("255 too many errors"), Some(255));
        assert_eq!(leading_code("Error (18) timed out"), None);
        assert_eq!(leading_code(""), None);
        assert_eq!(leading_code("-"), None);
    }

    #[test]
    fn test_init_label_from_json() {
        assert_eq!(
            init_label(Some(r#"{"initialized": true}"#), None, None).as_deref(),
            Some("Done")
        );
        assert_eq!(
            init_label(Some(r#"{"state": "green"}"#), None, None).as_deref(),
            Some("Done")
        );
        assert_eq!(
            init_label(Some(r#"{"state": "unknown"}"#), None, None).as_deref(),
            Some("Unknown")
        );
        assert_eq!(
            init_label(Some("not json"), Some("0 ok"), Some(0)).as_deref(),
            Some("Done")
        );
        assert_eq!(init_label(None, None, None), None);
    }

    #[tokio::test]
    async fn test_missing_replica_is_replication_disabled() {
        let dir = FakeDir {
            replica: None,
            agreements: vec![],
        };
        let err = snapshot(&dir, "dc=example,dc=com", &SnapshotOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::ReplicationDisabled { .. }));
        assert_eq!(err.code(), "replication-disabled");
    }

    #[tokio::test]
    async fn test_snapshot_healthy_summary() {
        let now = now_epoch();
        let dir = FakeDir {
            replica: Some(replica_entry()),
            agreements: vec![agreement_entry("agmt to c1:636", now - 5)],
        };
        let info = snapshot(&dir, "dc=example,dc=com", &SnapshotOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(info.replica.enabled, Some(true));
        assert!(info.summary.configured);
        assert!(info.summary.working);
        assert!(info.summary.finished);
        assert!(info.summary.problems.is_empty());
        assert_eq!(
            info.agreements[0].phase,
            Some(crate::model::AgreementPhase::Finished)
        );
    }

    #[tokio::test]
    async fn test_stale_update_is_unhealthy_despite_code_zero() {
        let now = now_epoch();
        let dir = FakeDir {
            replica: Some(replica_entry()),
            agreements: vec![agreement_entry("agmt to c1:636", now - 10_000)],
        };
        let options = SnapshotOptions {
            stale_seconds: 300,
            ..Default::default()
        };
        let info = snapshot(&dir, "dc=example,dc=com", &options, None)
            .await
            .unwrap();
        assert!(!info.summary.working);
        assert!(!info.summary.finished);
        assert!(info
            .summary
            .problems
            .iter()
            .any(|p| p.contains("stale >300s")));
    }

    #[tokio::test]
    async fn test_invalid_timestamp_treated_as_stale() {
        let now = now_epoch();
        let mut entry = agreement_entry("agmt to c1:636", now);
        entry.attrs.insert(
            "nsds5replicaLastUpdateEnd".into(),
            vec!["20230229120000Z".into()],
        );
        let dir = FakeDir {
            replica: Some(replica_entry()),
            agreements: vec![entry],
        };
        let info = snapshot(&dir, "dc=example,dc=com", &SnapshotOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(info.agreements[0].last_update_epoch, None);
        assert!(!info.summary.finished);
    }

    #[tokio::test]
    async fn test_filter_warns_on_unmatched_token() {
        let now = now_epoch();
        let dir = FakeDir {
            replica: Some(replica_entry()),
            agreements: vec![agreement_entry("agmt to c1:636", now - 5)],
        };
        let options = SnapshotOptions {
            agreement_filter: Some(vec!["c1".into(), "c9".into()]),
            ..Default::default()
        };
        let info = snapshot(&dir, "dc=example,dc=com", &options, None)
            .await
            .unwrap();
        assert_eq!(info.agreements.len(), 1);
        assert_eq!(info.warnings.len(), 1);
        assert!(info.warnings[0].contains("c9"));
    }

    #[tokio::test]
    async fn test_backlog_merged_by_name() {
        let now = now_epoch();
        let dir = FakeDir {
            replica: Some(replica_entry()),
            agreements: vec![agreement_entry("agmt to c1:636", now - 5)],
        };
        let mut backlog = HashMap::new();
        backlog.insert("agmt to c1:636".to_string(), 3i64);
        let info = snapshot(
            &dir,
            "dc=example,dc=com",
            &SnapshotOptions::default(),
            Some(&backlog),
        )
        .await
        .unwrap();
        assert_eq!(info.agreements[0].backlog, Some(3));
        assert!(!info.summary.finished);
    }

    #[tokio::test]
    async fn test_unknown_status_is_distinct_from_success() {
        let now = now_epoch();
        let mut entry = agreement_entry("agmt to c1:636", now - 5);
        entry.attrs.remove("nsds5replicaLastUpdateStatus");
        let dir = FakeDir {
            replica: Some(replica_entry()),
            agreements: vec![entry],
        };
        let info = snapshot(&dir, "dc=example,dc=com", &SnapshotOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(info.agreements[0].last_update_code, None);
        assert!(!info.summary.finished);
    }
}
