//! Common fixtures: an in-memory directory instance for integration tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use dsrepl_core::snapshot::replica_dn;
use dsrepl_ldap::client::{DirectoryOps, ModifyOp, Scope};
use dsrepl_ldap::error::{LdapError, Result};
use dsrepl_ldap::ldif::Entry;

/// In-memory stand-in for one 389-DS instance's config tree.
///
/// Honors the equality filters the core actually issues; entries are kept
/// in creation order like a real backend enumeration.
pub struct TestDirectory {
    entries: Mutex<Vec<Entry>>,
}

impl TestDirectory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Directory with an enabled replica entry for `suffix`.
    pub fn with_replica(suffix: &str) -> Self {
        let dir = Self::new();
        let mut replica = Entry {
            dn: replica_dn(suffix),
            attrs: HashMap::new(),
        };
        replica
            .attrs
            .insert("nsds5ReplicaEnabled".into(), vec!["on".into()]);
        replica.attrs.insert(
            "nsds50ruv".into(),
            vec!["{replicageneration} 61f4f1a2000000010000".into()],
        );
        dir.insert(replica);
        dir
    }

    pub fn insert(&self, entry: Entry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn set_attr(&self, dn: &str, attr: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.dn == dn) {
            entry.attrs.insert(attr.to_string(), vec![value.to_string()]);
        }
    }

    pub fn remove_attr(&self, dn: &str, attr: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.dn == dn) {
            entry.attrs.retain(|k, _| !k.eq_ignore_ascii_case(attr));
        }
    }

    pub fn get_attr(&self, dn: &str, attr: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.dn == dn)
            .and_then(|e| e.first(attr).map(str::to_string))
    }
}

/// Equality pairs of a filter like `(&(objectClass=x)(cn=y))`.
fn eq_pairs(filter: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for segment in filter.split('(') {
        let Some(segment) = segment.split(')').next() else {
            continue;
        };
        if segment.is_empty() || segment == "&" || segment == "|" {
            continue;
        }
        if let Some((attr, value)) = segment.split_once('=') {
            pairs.push((attr.to_string(), value.to_string()));
        }
    }
    pairs
}

fn matches_filter(entry: &Entry, filter: &str) -> bool {
    eq_pairs(filter).iter().all(|(attr, value)| {
        if value == "*" {
            return entry.all(attr).is_some() || attr.eq_ignore_ascii_case("objectclass");
        }
        entry
            .all(attr)
            .map(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value)))
            .unwrap_or(false)
    })
}

fn is_direct_child(dn: &str, base: &str) -> bool {
    dn.strip_suffix(base)
        .and_then(|head| head.strip_suffix(','))
        .map(|rdn| !rdn.contains(','))
        .unwrap_or(false)
}

#[async_trait]
impl DirectoryOps for TestDirectory {
    async fn search_one(
        &self,
        base: &str,
        _scope: Scope,
        filter: &str,
        _attrs: &[&str],
    ) -> Result<Entry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.dn == base && matches_filter(e, filter))
            .cloned()
            .ok_or(LdapError::NotFound {
                dn: base.to_string(),
            })
    }

    async fn search(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        _attrs: &[&str],
    ) -> Result<Vec<Entry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| match scope {
                Scope::Base => e.dn == base,
                Scope::One => is_direct_child(&e.dn, base),
                Scope::Sub => e.dn == base || e.dn.ends_with(&format!(",{base}")),
            })
            .filter(|e| matches_filter(e, filter))
            .cloned()
            .collect())
    }

    async fn add(&self, dn: &str, attrs: &[(String, Vec<String>)]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.dn == dn) {
            return Err(LdapError::Protocol {
                reason: format!("rc=68: entry already exists: {dn}"),
            });
        }
        let mut entry = Entry {
            dn: dn.to_string(),
            attrs: HashMap::new(),
        };
        for (attr, values) in attrs {
            entry.attrs.insert(attr.clone(), values.clone());
        }
        entries.push(entry);
        Ok(())
    }

    async fn modify(&self, dn: &str, changes: &[ModifyOp]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.dn == dn)
            .ok_or(LdapError::NotFound { dn: dn.to_string() })?;
        for change in changes {
            match change {
                ModifyOp::Add { attr, values } => {
                    entry
                        .attrs
                        .entry(attr.clone())
                        .or_default()
                        .extend(values.iter().cloned());
                }
                ModifyOp::Replace { attr, values } => {
                    entry.attrs.insert(attr.clone(), values.clone());
                }
                ModifyOp::Delete { attr, .. } => {
                    entry.attrs.retain(|k, _| !k.eq_ignore_ascii_case(attr));
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, dn: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.dn != dn);
        if entries.len() == before {
            return Err(LdapError::NotFound { dn: dn.to_string() });
        }
        Ok(())
    }
}
