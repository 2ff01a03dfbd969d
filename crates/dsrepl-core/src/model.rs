//! Typed view of replica and agreement state.
//!
//! Raw directory attributes are normalized into explicit optional fields;
//! anything unrecognized or unsupported lands in a warnings list, never in
//! a loosely-typed map threaded through business logic. Classification is
//! a closed enum with a total mapping from observed fields.

use serde::{Deserialize, Serialize};

/// Replica configuration for one suffix on one instance. Read-only here.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaInfo {
    /// Replica entry DN.
    pub dn: String,
    /// `nsds5ReplicaEnabled`, when present.
    pub enabled: Option<bool>,
    /// Opaque RUV text, used only for presence/diff.
    pub ruv: Option<String>,
}

/// Wire transport of an agreement endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgreementTransport {
    /// Plaintext LDAP.
    #[serde(rename = "LDAP")]
    Ldap,
    /// Opportunistic TLS over the LDAP port.
    #[serde(rename = "StartTLS")]
    StartTls,
    /// Implicit TLS (LDAPS).
    #[serde(rename = "LDAPS")]
    Ldaps,
}

impl AgreementTransport {
    /// Value stored in `nsds5ReplicaTransportInfo`.
    pub fn transport_info(self) -> &'static str {
        match self {
            AgreementTransport::Ldap => "LDAP",
            AgreementTransport::StartTls => "TLS",
            AgreementTransport::Ldaps => "SSL",
        }
    }
}

/// Observed status of one agreement, normalized from directory attributes.
///
/// Status codes are the leading signed integer of the raw status strings;
/// a missing or unparseable code is `None` ("unknown"), which is distinct
/// from success (0) and failure (nonzero). Epochs come from the
/// Generalized-Time codec; an invalid timestamp yields `None` and is
/// treated as stale beyond any window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgreementStatus {
    /// Agreement entry DN.
    pub dn: String,
    /// Agreement cn.
    pub name: Option<String>,
    /// Consumer hostname.
    pub host: Option<String>,
    /// Consumer port.
    pub port: Option<u16>,
    /// Bind DN used toward the consumer.
    pub bind_dn: Option<String>,
    /// Whether the agreement itself is enabled.
    pub enabled: Option<bool>,
    /// An update or init is currently in progress.
    pub busy: Option<bool>,
    /// Raw `nsds5replicaLastInitStatus`.
    pub last_init_status: Option<String>,
    /// Parsed init result code.
    pub last_init_code: Option<i64>,
    /// Raw init end timestamp.
    pub last_init_end: Option<String>,
    /// Init end as epoch seconds.
    pub last_init_epoch: Option<i64>,
    /// Label derived from the JSON init status attribute, when present.
    pub init_status_label: Option<String>,
    /// Raw `nsds5replicaLastUpdateStatus`.
    pub last_update_status: Option<String>,
    /// Parsed update result code.
    pub last_update_code: Option<i64>,
    /// Raw update start timestamp.
    pub last_update_start: Option<String>,
    /// Update start as epoch seconds.
    pub last_update_start_epoch: Option<i64>,
    /// Raw update end timestamp.
    pub last_update_end: Option<String>,
    /// Update end as epoch seconds.
    pub last_update_epoch: Option<i64>,
    /// Change backlog toward this consumer, when a monitor probe saw one.
    pub backlog: Option<i64>,
    /// Phase classification, filled in by consumers that classify.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<AgreementPhase>,
}

impl AgreementStatus {
    /// Agreement cn, or the DN when no cn was returned.
    pub fn short_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.dn)
    }

    /// Age of the last completed update, `None` when never observed.
    pub fn update_age(&self, now_epoch: i64) -> Option<i64> {
        self.last_update_epoch.map(|e| now_epoch - e)
    }

    /// Last update succeeded and completed inside the staleness window.
    pub fn fresh_success(&self, now_epoch: i64, stale_seconds: i64) -> bool {
        self.last_update_code == Some(0)
            && self
                .update_age(now_epoch)
                .map(|age| (0..=stale_seconds).contains(&age))
                .unwrap_or(false)
    }

    /// Init is acceptable: code 0, or never observed.
    pub fn init_ok(&self) -> bool {
        matches!(self.last_init_code, None | Some(0))
    }
}

/// Health phase of one agreement. Closed set; `classify` is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgreementPhase {
    /// Entry missing or disabled.
    Unconfigured,
    /// Present and enabled, no evidence of activity.
    Configured,
    /// Activity observed: busy, advancing timestamps, or a fresh success.
    Working,
    /// Converged: idle, init acceptable, fresh success, no known backlog.
    Finished,
}

/// Inputs to [`classify`] beyond the observation itself.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext {
    /// Wall-clock now, epoch seconds.
    pub now_epoch: i64,
    /// Maximum acceptable age of the last successful update.
    pub stale_seconds: i64,
    /// Whether a failed or absent init blocks `Finished`.
    pub require_init_success: bool,
    /// Cross-cycle trend evidence (advancing timestamps), supplied by the
    /// wait engine; false for one-shot classification.
    pub trending: bool,
}

/// Map an observation to exactly one phase.
pub fn classify(status: &AgreementStatus, cx: &ClassifyContext) -> AgreementPhase {
    if status.enabled != Some(true) {
        return AgreementPhase::Unconfigured;
    }
    let busy = status.busy == Some(true);
    let fresh = status.fresh_success(cx.now_epoch, cx.stale_seconds);
    let init_ok = !cx.require_init_success || status.init_ok();
    let backlog_ok = matches!(status.backlog, None | Some(0));
    if !busy && init_ok && fresh && backlog_ok {
        return AgreementPhase::Finished;
    }
    if busy || cx.trending || fresh {
        return AgreementPhase::Working;
    }
    AgreementPhase::Configured
}

/// Aggregated health booleans for a set of agreements.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    /// At least the required agreements exist and are enabled.
    pub configured: bool,
    /// Evidence of replication activity.
    pub working: bool,
    /// All agreements converged.
    pub finished: bool,
    /// Per-agreement problem descriptions, sorted and deduplicated.
    pub problems: Vec<String>,
}

/// One full read of replica + agreement state for a suffix.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationInfo {
    /// The replica entry.
    pub replica: ReplicaInfo,
    /// Agreements under the replica, after optional name filtering.
    pub agreements: Vec<AgreementStatus>,
    /// Derived health summary.
    pub summary: Summary,
    /// Non-fatal oddities: filter tokens that matched nothing,
    /// unparseable attributes, and the like.
    pub warnings: Vec<String>,
}

/// Parse an `on`/`true`/`yes`/`1` style directory boolean.
pub fn parse_dir_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "on" | "true" | "yes" | "1"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy(now: i64) -> AgreementStatus {
        AgreementStatus {
            dn: "cn=agmt to c1:636,cn=replica".into(),
            name: Some("agmt to c1:636".into()),
            enabled: Some(true),
            busy: Some(false),
            last_init_code: Some(0),
            last_update_code: Some(0),
            last_update_epoch: Some(now - 10),
            ..Default::default()
        }
    }

    fn cx(now: i64) -> ClassifyContext {
        ClassifyContext {
            now_epoch: now,
            stale_seconds: 300,
            require_init_success: true,
            trending: false,
        }
    }

    #[test]
    fn test_classify_finished() {
        let now = 1_700_000_000;
        assert_eq!(classify(&healthy(now), &cx(now)), AgreementPhase::Finished);
    }

    #[test]
    fn test_classify_disabled_is_unconfigured() {
        let now = 1_700_000_000;
        let mut s = healthy(now);
        s.enabled = Some(false);
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Unconfigured);
        s.enabled = None;
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Unconfigured);
    }

    #[test]
    fn test_classify_busy_is_working() {
        let now = 1_700_000_000;
        let mut s = healthy(now);
        s.busy = Some(true);
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Working);
    }

    #[test]
    fn test_stale_success_not_finished() {
        let now = 1_700_000_000;
        let mut s = healthy(now);
        s.last_update_epoch = Some(now - 1_000);
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Configured);
        assert!(!s.fresh_success(now, 300));
    }

    #[test]
    fn test_missing_timestamp_is_stale() {
        let now = 1_700_000_000;
        let mut s = healthy(now);
        s.last_update_epoch = None;
        assert!(!s.fresh_success(now, 300));
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Configured);
    }

    #[test]
    fn test_failed_init_blocks_finished() {
        let now = 1_700_000_000;
        let mut s = healthy(now);
        s.last_init_code = Some(-1);
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Working);
        let mut relaxed = cx(now);
        relaxed.require_init_success = false;
        assert_eq!(classify(&s, &relaxed), AgreementPhase::Finished);
    }

    #[test]
    fn test_nonzero_backlog_blocks_finished() {
        let now = 1_700_000_000;
        let mut s = healthy(now);
        s.backlog = Some(7);
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Working);
        s.backlog = Some(0);
        assert_eq!(classify(&s, &cx(now)), AgreementPhase::Finished);
    }

    #[test]
    fn test_dir_bool_forms() {
        assert!(parse_dir_bool("on"));
        assert!(parse_dir_bool(" TRUE "));
        assert!(parse_dir_bool("1"));
        assert!(!parse_dir_bool("off"));
        assert!(!parse_dir_bool(""));
    }

    #[test]
    fn test_transport_info_mapping() {
        assert_eq!(AgreementTransport::Ldaps.transport_info(), "SSL");
        assert_eq!(AgreementTransport::StartTls.transport_info(), "TLS");
        assert_eq!(AgreementTransport::Ldap.transport_info(), "LDAP");
    }
}
