//! Best-effort backlog sampling via `dsconf -j replication monitor`.
//!
//! The probe runs under its own short timeout and degrades to "backlog
//! unknown" on any failure; it never aborts the snapshot or wait that
//! asked for it.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use dsrepl_ldap::config::{ldapi_url, LdapConnParams};

/// A sampler for per-agreement change backlog.
#[async_trait]
pub trait BacklogProbe: Send + Sync {
    /// Sample backlog counts keyed by agreement name.
    ///
    /// `None` means the probe could not sample this cycle; callers treat
    /// that as unknown, not as zero and not as failure.
    async fn sample(&self, suffix: &str) -> Option<HashMap<String, i64>>;
}

/// Probe backed by the `dsconf` JSON replication monitor.
#[derive(Debug, Clone)]
pub struct DsconfMonitor {
    /// Instance name for the LDAPI socket paths.
    pub instance: String,
    /// LDAPS fallback host when LDAPI is unavailable.
    pub ldaps_host: Option<String>,
    /// LDAPS fallback port.
    pub ldaps_port: u16,
    /// Bind DN for the LDAPS fallback.
    pub bind_dn: Option<String>,
    /// Password for the LDAPS fallback.
    pub bind_pw: Option<String>,
    /// Probe timeout; independent of the snapshot's op timeout.
    pub timeout: Duration,
}

impl DsconfMonitor {
    /// Probe a local instance over LDAPI only.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            ldaps_host: None,
            ldaps_port: 636,
            bind_dn: None,
            bind_pw: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// Derive probe settings from connection parameters.
    pub fn from_params(params: &LdapConnParams) -> Self {
        Self {
            instance: params.instance.clone(),
            ldaps_host: params.ldaps_host.clone(),
            ldaps_port: params.ldaps_port,
            bind_dn: params.bind_dn.clone(),
            bind_pw: params.bind_pw.clone(),
            timeout: Duration::from_secs(10),
        }
    }

    async fn run_dsconf(&self, argv: &[String]) -> Option<serde_json::Value> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("dsconf")
                .args(argv)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() || output.stdout.is_empty() {
            return None;
        }
        serde_json::from_slice(&output.stdout).ok()
    }
}

#[async_trait]
impl BacklogProbe for DsconfMonitor {
    async fn sample(&self, suffix: &str) -> Option<HashMap<String, i64>> {
        for url in [
            ldapi_url(&self.instance, "/run"),
            ldapi_url(&self.instance, "/data/run"),
        ] {
            let argv = vec![
                "-j".to_string(),
                url,
                "replication".to_string(),
                "monitor".to_string(),
                "--suffix".to_string(),
                suffix.to_string(),
            ];
            if let Some(value) = self.run_dsconf(&argv).await {
                return Some(extract_backlogs(&value));
            }
        }
        if let (Some(host), Some(dn), Some(pw)) = (&self.ldaps_host, &self.bind_dn, &self.bind_pw) {
            let argv = vec![
                "-j".to_string(),
                format!("ldaps://{host}:{}", self.ldaps_port),
                "-D".to_string(),
                dn.clone(),
                "-w".to_string(),
                pw.clone(),
                "replication".to_string(),
                "monitor".to_string(),
                "--suffix".to_string(),
                suffix.to_string(),
            ];
            if let Some(value) = self.run_dsconf(&argv).await {
                return Some(extract_backlogs(&value));
            }
        }
        debug!(suffix, "backlog probe could not sample");
        None
    }
}

/// Walk the monitor JSON for any `*backlog*` key adjacent to a `name`.
///
/// The monitor output layout varies across server versions; the walk is
/// deliberately shape-agnostic.
pub fn extract_backlogs(value: &serde_json::Value) -> HashMap<String, i64> {
    let mut out = HashMap::new();
    walk(value, &mut out);
    out
}

fn walk(value: &serde_json::Value, out: &mut HashMap<String, i64>) {
    match value {
        serde_json::Value::Object(map) => {
            let name = map.get("name").and_then(|v| v.as_str());
            let backlog = map.iter().find_map(|(k, v)| {
                if !k.to_ascii_lowercase().contains("backlog") {
                    return None;
                }
                v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            });
            if let (Some(name), Some(backlog)) = (name, backlog) {
                out.insert(name.to_string(), backlog);
            }
            for v in map.values() {
                walk(v, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_backlogs_nested() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "type": "list",
                "items": [
                    {"name": "agmt to c1:636", "replica-backlog": 0, "status": "green"},
                    {"agreements": [{"name": "agmt to c2:636", "backlogCount": "12"}]}
                ]
            }"#,
        )
        .unwrap();
        let backlogs = extract_backlogs(&value);
        assert_eq!(backlogs.get("agmt to c1:636"), Some(&0));
        assert_eq!(backlogs.get("agmt to c2:636"), Some(&12));
    }

    #[test]
    fn test_extract_backlogs_ignores_nameless_nodes() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"backlog": 5, "items": []}"#).unwrap();
        assert!(extract_backlogs(&value).is_empty());
    }
}
