//! Agreement reconciler: drift-minimal create/update/delete.
//!
//! Resolves "which entry is this" by explicit name first, then by
//! consumer endpoint. Writes touch only the resolved agreement entry,
//! never its siblings and never the replica entry. Version-dependent
//! tunables are applied as individual targeted writes so a server that
//! rejects one degrades to a warning instead of failing the whole
//! operation.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};

use dsrepl_ldap::client::{escape_filter_value, DirectoryOps, ModifyOp, Scope};
use dsrepl_ldap::config::BindMethod;
use dsrepl_ldap::error::LdapError;
use dsrepl_ldap::ldif::Entry;

use crate::error::{ReplError, Result};
use crate::model::{parse_dir_bool, AgreementTransport};
use crate::snapshot::replica_dn;

const ATTR_HOST: &str = "nsds5ReplicaHost";
const ATTR_PORT: &str = "nsds5ReplicaPort";
const ATTR_TRANSPORT: &str = "nsds5ReplicaTransportInfo";
const ATTR_ROOT: &str = "nsds5ReplicaRoot";
const ATTR_BIND_DN: &str = "nsds5ReplicaBindDN";
const ATTR_BIND_METHOD: &str = "nsds5ReplicaBindMethod";
const ATTR_CREDENTIALS: &str = "nsds5ReplicaCredentials";
const ATTR_ENABLED: &str = "nsds5ReplicaEnabled";
const ATTR_BACKOFF_MIN: &str = "nsds5ReplicaBackoffMin";
const ATTR_BACKOFF_MAX: &str = "nsds5ReplicaBackoffMax";
const ATTR_PURGE_DELAY: &str = "nsds5ReplicaPurgeDelay";
const ATTR_COMPRESSION: &str = "nsds5ReplicaCompression";
const ATTR_DESCRIPTION: &str = "description";

const EXISTING_ATTRS: &[&str] = &[
    "cn",
    ATTR_HOST,
    ATTR_PORT,
    ATTR_TRANSPORT,
    ATTR_ROOT,
    ATTR_BIND_DN,
    ATTR_BIND_METHOD,
    ATTR_ENABLED,
    ATTR_BACKOFF_MIN,
    ATTR_BACKOFF_MAX,
    ATTR_PURGE_DELAY,
    ATTR_COMPRESSION,
    ATTR_DESCRIPTION,
];

/// Desired presence of the agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    /// Ensure the agreement exists with the spec's attributes.
    Present,
    /// Ensure the agreement does not exist.
    Absent,
}

/// Desired shape of one replication agreement.
#[derive(Debug, Clone)]
pub struct AgreementSpec {
    /// Consumer hostname.
    pub consumer_host: String,
    /// Consumer port.
    pub consumer_port: u16,
    /// Explicit agreement cn; synthesized from the endpoint when absent.
    pub name: Option<String>,
    /// How the supplier authenticates to the consumer.
    pub bind_method: BindMethod,
    /// Bind DN for SIMPLE auth.
    pub bind_dn: Option<String>,
    /// Password for SIMPLE auth.
    pub bind_pw: Option<String>,
    /// Wire transport toward the consumer.
    pub transport: AgreementTransport,
    /// Client certificate reference for certificate auth.
    pub tls_client_cert: Option<PathBuf>,
    /// Client key reference for certificate auth.
    pub tls_client_key: Option<PathBuf>,
    /// Minimum retry backoff, seconds.
    pub backoff_min: Option<u32>,
    /// Maximum retry backoff, seconds.
    pub backoff_max: Option<u32>,
    /// Changelog purge delay, seconds.
    pub purge_delay: Option<u32>,
    /// Enable compression where the server version supports it.
    pub compression: Option<bool>,
}

impl AgreementSpec {
    /// Spec for an endpoint with LDAPS transport and SIMPLE auth defaults.
    pub fn new(consumer_host: impl Into<String>, consumer_port: u16) -> Self {
        Self {
            consumer_host: consumer_host.into(),
            consumer_port,
            name: None,
            bind_method: BindMethod::Simple,
            bind_dn: None,
            bind_pw: None,
            transport: AgreementTransport::Ldaps,
            tls_client_cert: None,
            tls_client_key: None,
            backoff_min: None,
            backoff_max: None,
            purge_delay: None,
            compression: None,
        }
    }

    /// Agreement cn: the explicit name, or the endpoint naming template.
    pub fn agreement_cn(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("agmt to {}:{}", self.consumer_host, self.consumer_port))
    }

    /// Reject self-contradictory auth configuration before any write.
    pub fn validate(&self) -> Result<()> {
        match self.bind_method {
            BindMethod::Simple => {
                if self.bind_dn.is_none() {
                    return Err(ReplError::Validation {
                        hint: "bind_method=simple requires bind_dn".into(),
                    });
                }
                if self.bind_pw.is_none() {
                    return Err(ReplError::Validation {
                        hint: "bind_method=simple requires bind_pw".into(),
                    });
                }
                if self.tls_client_cert.is_some() || self.tls_client_key.is_some() {
                    return Err(ReplError::Validation {
                        hint: "bind_method=simple is mutually exclusive with tls_client_cert/tls_client_key".into(),
                    });
                }
            }
            BindMethod::SslClientAuth => {
                if self.tls_client_cert.is_none() {
                    return Err(ReplError::Validation {
                        hint: "bind_method=sslclientauth requires tls_client_cert".into(),
                    });
                }
                if self.tls_client_key.is_none() {
                    return Err(ReplError::Validation {
                        hint: "bind_method=sslclientauth requires tls_client_key".into(),
                    });
                }
                if self.bind_dn.is_some() || self.bind_pw.is_some() {
                    return Err(ReplError::Validation {
                        hint: "bind_method=sslclientauth is mutually exclusive with bind_dn/bind_pw".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Core attribute set: endpoint, transport, root, auth mode.
    ///
    /// Credentials are not part of the diffable set; the server never
    /// returns them. See [`reconcile`] for the rotation policy.
    fn core_attrs(&self, suffix: &str) -> Vec<(String, String)> {
        let mut attrs = vec![
            (ATTR_HOST.to_string(), self.consumer_host.clone()),
            (ATTR_PORT.to_string(), self.consumer_port.to_string()),
            (
                ATTR_TRANSPORT.to_string(),
                self.transport.transport_info().to_string(),
            ),
            (ATTR_ROOT.to_string(), suffix.to_string()),
            (
                ATTR_DESCRIPTION.to_string(),
                format!("agmt to {}:{}", self.consumer_host, self.consumer_port),
            ),
        ];
        match self.bind_method {
            BindMethod::Simple => {
                if let Some(dn) = &self.bind_dn {
                    attrs.push((ATTR_BIND_DN.to_string(), dn.clone()));
                }
                attrs.push((ATTR_BIND_METHOD.to_string(), "SIMPLE".to_string()));
            }
            BindMethod::SslClientAuth => {
                attrs.push((ATTR_BIND_METHOD.to_string(), "SSLCLIENTAUTH".to_string()));
            }
        }
        attrs
    }

    /// Version-dependent tunables, each applied as its own targeted write.
    fn tunable_attrs(&self) -> Vec<(String, String)> {
        let mut attrs = Vec::new();
        if let Some(v) = self.backoff_min {
            attrs.push((ATTR_BACKOFF_MIN.to_string(), v.to_string()));
        }
        if let Some(v) = self.backoff_max {
            attrs.push((ATTR_BACKOFF_MAX.to_string(), v.to_string()));
        }
        if let Some(v) = self.purge_delay {
            attrs.push((ATTR_PURGE_DELAY.to_string(), v.to_string()));
        }
        if let Some(v) = self.compression {
            attrs.push((
                ATTR_COMPRESSION.to_string(),
                if v { "on" } else { "off" }.to_string(),
            ));
        }
        attrs
    }

    fn effective(&self) -> EffectiveAttributes {
        EffectiveAttributes {
            host: self.consumer_host.clone(),
            port: self.consumer_port,
            bind_method: match self.bind_method {
                BindMethod::Simple => "simple",
                BindMethod::SslClientAuth => "sslclientauth",
            }
            .to_string(),
            transport: self.transport,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
            purge_delay: self.purge_delay,
            compression: self.compression,
        }
    }
}

/// Attributes the reconciler validated or applied.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveAttributes {
    /// Consumer hostname.
    pub host: String,
    /// Consumer port.
    pub port: u16,
    /// Auth mode applied.
    pub bind_method: String,
    /// Transport applied.
    pub transport: AgreementTransport,
    /// Minimum backoff, when specified.
    pub backoff_min: Option<u32>,
    /// Maximum backoff, when specified.
    pub backoff_max: Option<u32>,
    /// Purge delay, when specified.
    pub purge_delay: Option<u32>,
    /// Compression, when specified.
    pub compression: Option<bool>,
}

/// Result of one reconcile call.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    /// Whether any directory write was applied.
    pub changed: bool,
    /// DN of the managed agreement (synthesized for absent no-ops).
    pub agreement_dn: String,
    /// Attributes validated or applied.
    pub effective: EffectiveAttributes,
    /// Non-fatal degradations: ambiguous matches, skipped tunables.
    pub warnings: Vec<String>,
}

async fn resolve_existing(
    ops: &dyn DirectoryOps,
    base: &str,
    spec: &AgreementSpec,
) -> Result<Vec<Entry>> {
    if let Some(name) = &spec.name {
        let filter = format!(
            "(&(objectClass=nsDS5ReplicationAgreement)(cn={}))",
            escape_filter_value(name)
        );
        let by_name = ops.search(base, Scope::One, &filter, EXISTING_ATTRS).await?;
        if !by_name.is_empty() {
            return Ok(by_name);
        }
    }
    let filter = format!(
        "(&(objectClass=nsDS5ReplicationAgreement)({ATTR_HOST}={})({ATTR_PORT}={}))",
        escape_filter_value(&spec.consumer_host),
        spec.consumer_port
    );
    Ok(ops.search(base, Scope::One, &filter, EXISTING_ATTRS).await?)
}

/// Apply one version-dependent tunable; a rejected write degrades to a
/// warning, anything else propagates.
async fn apply_tunable(
    ops: &dyn DirectoryOps,
    dn: &str,
    attr: &str,
    value: &str,
    warnings: &mut Vec<String>,
) -> Result<bool> {
    let change = ModifyOp::Replace {
        attr: attr.to_string(),
        values: vec![value.to_string()],
    };
    match ops.modify(dn, std::slice::from_ref(&change)).await {
        Ok(()) => Ok(true),
        Err(LdapError::Protocol { reason }) => {
            warnings.push(format!(
                "attribute {attr} not supported by this server version; skipped ({reason})"
            ));
            Ok(false)
        }
        Err(other) => Err(other.into()),
    }
}

/// Idempotently bring one agreement to the desired state.
///
/// Credential rotation policy: `nsds5ReplicaCredentials` is written on
/// create and whenever the bind DN changes; the directory never returns
/// the stored secret, so it cannot participate in the drift diff.
pub async fn reconcile(
    ops: &dyn DirectoryOps,
    suffix: &str,
    spec: &AgreementSpec,
    state: DesiredState,
) -> Result<ReconcileOutcome> {
    spec.validate()?;

    let base = replica_dn(suffix);
    ops.search_one(&base, Scope::Base, "(objectClass=*)", &["cn"])
        .await
        .map_err(|e| match e {
            LdapError::NotFound { .. } => ReplError::ReplicationDisabled {
                suffix: suffix.to_string(),
            },
            other => ReplError::Ldap(other),
        })?;

    let mut warnings = Vec::new();
    let existing = resolve_existing(ops, &base, spec).await?;
    if existing.len() > 1 {
        warnings.push(format!(
            "multiple agreements match {}:{}; managing the first by creation order",
            spec.consumer_host, spec.consumer_port
        ));
    }
    let current = existing.first();

    if state == DesiredState::Absent {
        let (changed, dn) = match current {
            Some(entry) => {
                ops.delete(&entry.dn).await?;
                info!(dn = %entry.dn, "deleted replication agreement");
                (true, entry.dn.clone())
            }
            None => (false, format!("cn={},{base}", spec.agreement_cn())),
        };
        return Ok(ReconcileOutcome {
            changed,
            agreement_dn: dn,
            effective: spec.effective(),
            warnings,
        });
    }

    let mut changed = false;
    let agmt_dn = match current {
        Some(entry) => entry.dn.clone(),
        None => format!("cn={},{base}", spec.agreement_cn()),
    };

    match current {
        None => {
            let mut add_attrs: Vec<(String, Vec<String>)> = vec![
                (
                    "objectClass".to_string(),
                    vec!["top".to_string(), "nsDS5ReplicationAgreement".to_string()],
                ),
                ("cn".to_string(), vec![spec.agreement_cn()]),
            ];
            for (attr, value) in spec.core_attrs(suffix) {
                add_attrs.push((attr, vec![value]));
            }
            if spec.bind_method == BindMethod::Simple {
                if let Some(pw) = &spec.bind_pw {
                    add_attrs.push((ATTR_CREDENTIALS.to_string(), vec![pw.clone()]));
                }
            }
            ops.add(&agmt_dn, &add_attrs).await?;
            ops.modify(
                &agmt_dn,
                &[ModifyOp::Replace {
                    attr: ATTR_ENABLED.to_string(),
                    values: vec!["on".to_string()],
                }],
            )
            .await?;
            info!(dn = %agmt_dn, host = %spec.consumer_host, port = spec.consumer_port,
                "created replication agreement");
            changed = true;
        }
        Some(entry) => {
            let mut changes: Vec<ModifyOp> = Vec::new();
            for (attr, value) in spec.core_attrs(suffix) {
                if entry.first(&attr) != Some(value.as_str()) {
                    changes.push(ModifyOp::Replace {
                        attr,
                        values: vec![value],
                    });
                }
            }
            let bind_dn_changed = changes.iter().any(|c| c.attr() == ATTR_BIND_DN);
            if bind_dn_changed && spec.bind_method == BindMethod::Simple {
                if let Some(pw) = &spec.bind_pw {
                    changes.push(ModifyOp::Replace {
                        attr: ATTR_CREDENTIALS.to_string(),
                        values: vec![pw.clone()],
                    });
                }
            }
            let enabled = entry.first(ATTR_ENABLED).map(parse_dir_bool).unwrap_or(false);
            if !enabled {
                changes.push(ModifyOp::Replace {
                    attr: ATTR_ENABLED.to_string(),
                    values: vec!["on".to_string()],
                });
            }
            if !changes.is_empty() {
                debug!(dn = %agmt_dn, changes = changes.len(), "applying agreement drift");
                ops.modify(&agmt_dn, &changes).await?;
                changed = true;
            }
        }
    }

    for (attr, value) in spec.tunable_attrs() {
        let already = current
            .map(|e| e.first(&attr) == Some(value.as_str()))
            .unwrap_or(false);
        if already {
            continue;
        }
        if apply_tunable(ops, &agmt_dn, &attr, &value, &mut warnings).await? {
            changed = true;
        }
    }

    Ok(ReconcileOutcome {
        changed,
        agreement_dn: agmt_dn,
        effective: spec.effective(),
        warnings,
    })
}
