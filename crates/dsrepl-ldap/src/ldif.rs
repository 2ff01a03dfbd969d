//! Minimal LDIF reader for `ldapsearch -LLL` output.
//!
//! Handles line folding (continuation lines start with a single space) and
//! base64-encoded values (`attr:: dmFsdWU=`). Attribute lookup is
//! case-insensitive because directory servers are free to return any
//! casing for attribute names.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// One directory entry: DN plus multi-valued attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute values keyed by the name as the server returned it.
    pub attrs: HashMap<String, Vec<String>>,
}

impl Entry {
    /// First value of `name`, matched case-insensitively.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.all(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// All values of `name`, matched case-insensitively.
    pub fn all(&self, name: &str) -> Option<&Vec<String>> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Undo LDIF line folding.
fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        if let Some(cont) = raw.strip_prefix(' ') {
            if let Some(last) = lines.last_mut() {
                last.push_str(cont);
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    lines
}

/// Split `attr: value` / `attr:: base64`, decoding the latter.
fn split_attr_line(line: &str) -> Option<(String, String)> {
    let (name, rest) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = if let Some(b64) = rest.strip_prefix(':') {
        match BASE64.decode(b64.trim()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => rest.trim().to_string(),
        }
    } else {
        rest.trim().to_string()
    };
    Some((name.to_string(), value))
}

/// Parse zero or more entries separated by blank lines.
pub fn parse_entries(text: &str) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut cur: Option<Entry> = None;
    for line in unfold(text) {
        if line.trim().is_empty() {
            if let Some(e) = cur.take() {
                entries.push(e);
            }
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("dn:") {
            if let Some(e) = cur.take() {
                entries.push(e);
            }
            let dn = if lower.starts_with("dn::") {
                split_attr_line(&line).map(|(_, v)| v).unwrap_or_default()
            } else {
                line[3..].trim().to_string()
            };
            cur = Some(Entry {
                dn,
                attrs: HashMap::new(),
            });
            continue;
        }
        if let Some(entry) = cur.as_mut() {
            if let Some((name, value)) = split_attr_line(&line) {
                entry.attrs.entry(name).or_default().push(value);
            }
        }
    }
    if let Some(e) = cur.take() {
        entries.push(e);
    }
    entries
}

/// Parse at most one entry; `None` when the output contained no DN.
pub fn parse_single_entry(text: &str) -> Option<Entry> {
    parse_entries(text).into_iter().next()
}
