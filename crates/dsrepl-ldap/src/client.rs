//! Directory session over the OpenLDAP command-line tools.
//!
//! A session is established by probing candidate URLs in priority order
//! (LDAPI sockets, then LDAPS) with a RootDSE base search; the first URL
//! that answers is pinned for the life of the session. Falling back from
//! LDAPI to the network path is logged, never silent. Every operation runs
//! `ldapsearch`/`ldapmodify`/`ldapdelete` under the operation timeout and
//! the bounded retry policy.
//!
//! Sessions are scoped: create one per logical operation (snapshot,
//! reconcile, wait) and drop it with the call. Nothing is cached across
//! calls.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{BindMethod, LdapConnParams};
use crate::error::{LdapError, Result};
use crate::ldif::{self, Entry};
use crate::retry::RetryPolicy;

/// LDAP search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The base entry only.
    Base,
    /// Direct children of the base entry.
    One,
    /// The whole subtree.
    Sub,
}

impl Scope {
    fn as_arg(self) -> &'static str {
        match self {
            Scope::Base => "base",
            Scope::One => "one",
            Scope::Sub => "sub",
        }
    }
}

/// One change in an LDAP modify operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ModifyOp {
    /// Add values to an attribute.
    Add {
        /// Attribute name.
        attr: String,
        /// Values to add.
        values: Vec<String>,
    },
    /// Replace all values of an attribute.
    Replace {
        /// Attribute name.
        attr: String,
        /// Replacement values.
        values: Vec<String>,
    },
    /// Delete values (all values when empty).
    Delete {
        /// Attribute name.
        attr: String,
        /// Values to delete; empty deletes the attribute.
        values: Vec<String>,
    },
}

impl ModifyOp {
    /// Attribute this change touches.
    pub fn attr(&self) -> &str {
        match self {
            ModifyOp::Add { attr, .. }
            | ModifyOp::Replace { attr, .. }
            | ModifyOp::Delete { attr, .. } => attr,
        }
    }

    fn render(&self, out: &mut String) {
        let (op, attr, values) = match self {
            ModifyOp::Add { attr, values } => ("add", attr, values),
            ModifyOp::Replace { attr, values } => ("replace", attr, values),
            ModifyOp::Delete { attr, values } => ("delete", attr, values),
        };
        out.push_str(&format!("{op}: {attr}\n"));
        for v in values {
            out.push_str(&format!("{attr}: {v}\n"));
        }
        out.push_str("-\n");
    }
}

/// The operations higher layers issue against one directory instance.
///
/// The snapshot builder, reconciler, and wait engine consume this trait so
/// they can be exercised against scripted fakes.
#[async_trait]
pub trait DirectoryOps: Send + Sync {
    /// Read exactly one entry; `NotFound` when the base is absent.
    async fn search_one(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Entry>;

    /// Read zero or more entries.
    async fn search(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<Entry>>;

    /// Create an entry.
    async fn add(&self, dn: &str, attrs: &[(String, Vec<String>)]) -> Result<()>;

    /// Apply modify changes to an entry.
    async fn modify(&self, dn: &str, changes: &[ModifyOp]) -> Result<()>;

    /// Delete an entry.
    async fn delete(&self, dn: &str) -> Result<()>;
}

/// A pinned, authenticated session against one instance.
#[derive(Debug)]
pub struct LdapClient {
    params: LdapConnParams,
    url: String,
    auth_argv: Vec<String>,
    env: Vec<(String, String)>,
    retry: RetryPolicy,
}

impl LdapClient {
    /// Probe candidate URLs and pin the first that answers.
    ///
    /// An auth rejection on a candidate is surfaced immediately (retrying
    /// or falling through would just hammer the server with bad binds).
    pub async fn connect(params: LdapConnParams) -> Result<Self> {
        let urls = params.candidate_urls();
        if urls.is_empty() {
            return Err(LdapError::Validation {
                hint: "no LDAPI socket or LDAPS host configured".into(),
            });
        }
        let mut last: Option<LdapError> = None;
        for url in urls {
            let (auth_argv, env) = match auth_args(&params, &url) {
                Ok(v) => v,
                Err(e) => return Err(e),
            };
            let candidate = Self {
                params: params.clone(),
                url: url.clone(),
                auth_argv,
                env,
                retry: RetryPolicy::default(),
            };
            match candidate.probe_root_dse().await {
                Ok(()) => {
                    if url.starts_with("ldaps://") && params.use_ldapi {
                        warn!(url = %url, "LDAPI socket unavailable, falling back to network path");
                    }
                    debug!(url = %url, "directory session established");
                    return Ok(candidate);
                }
                Err(e @ LdapError::Auth { .. }) => return Err(e),
                Err(e) => {
                    debug!(url = %url, error = %e, "candidate URL failed");
                    last = Some(e);
                }
            }
        }
        Err(LdapError::Connection {
            target: params.candidate_urls().join(", "),
            detail: match last {
                Some(e) => format!("no usable LDAP URL (ldapi or ldaps) succeeded: {e}"),
                None => "no usable LDAP URL (ldapi or ldaps) succeeded".into(),
            },
        })
    }

    /// Replace the default retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The URL this session is pinned to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The parameters this session was opened with.
    pub fn params(&self) -> &LdapConnParams {
        &self.params
    }

    async fn probe_root_dse(&self) -> Result<()> {
        let mut argv = self.base_search_argv();
        argv.extend(["-s", "base", "-b", "", "1.1"].map(String::from));
        self.retry
            .run("connect", || async { self.run_cli(&argv, None, "").await })
            .await
            .map(|_| ())
    }

    fn base_search_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "ldapsearch".to_string(),
            "-LLL".to_string(),
            "-o".to_string(),
            format!("nettimeout={}", self.params.connect_timeout.as_secs()),
            "-o".to_string(),
            "ldif-wrap=no".to_string(),
        ];
        argv.extend(self.auth_argv.iter().cloned());
        argv.push("-H".to_string());
        argv.push(self.url.clone());
        argv
    }

    fn write_argv(&self, program: &str) -> Vec<String> {
        let mut argv = vec![
            program.to_string(),
            "-o".to_string(),
            format!("nettimeout={}", self.params.connect_timeout.as_secs()),
        ];
        argv.extend(self.auth_argv.iter().cloned());
        argv.push("-H".to_string());
        argv.push(self.url.clone());
        argv
    }

    async fn run_cli(&self, argv: &[String], stdin: Option<&str>, dn_context: &str) -> Result<String> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| LdapError::Connection {
            target: self.url.clone(),
            detail: format!("failed to spawn {}: {e}", argv[0]),
        })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| LdapError::Connection {
                        target: self.url.clone(),
                        detail: format!("failed to feed {}: {e}", argv[0]),
                    })?;
            }
        }

        let output = match tokio::time::timeout(self.params.op_timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LdapError::Connection {
                    target: self.url.clone(),
                    detail: format!("i/o error waiting for {}: {e}", argv[0]),
                })
            }
            Err(_) => {
                return Err(LdapError::Connection {
                    target: self.url.clone(),
                    detail: format!(
                        "operation timed out after {}s",
                        self.params.op_timeout.as_secs()
                    ),
                })
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout
        } else {
            stderr
        };
        Err(classify_exit(
            output.status.code(),
            &detail,
            dn_context,
            &self.url,
        ))
    }
}

/// Map a CLI exit into the failure taxonomy.
///
/// The OpenLDAP tools exit with the LDAP result code: 32 noSuchObject,
/// 48/49 auth failures, 50 insufficient access. Connect failures show up
/// as rc 255 with "Can't contact LDAP server" diagnostics.
fn classify_exit(rc: Option<i32>, diagnostics: &str, dn_context: &str, url: &str) -> LdapError {
    let hint: String = diagnostics.chars().take(512).collect();
    match rc {
        Some(32) => LdapError::NotFound {
            dn: dn_context.to_string(),
        },
        Some(code @ (48 | 49 | 50)) => LdapError::Auth { code, hint },
        Some(254 | 255) => LdapError::Connection {
            target: url.to_string(),
            detail: hint,
        },
        Some(_) if diagnostics.contains("Can't contact") => LdapError::Connection {
            target: url.to_string(),
            detail: hint,
        },
        Some(code) => LdapError::Protocol {
            reason: format!("rc={code}: {hint}"),
        },
        None => LdapError::Connection {
            target: url.to_string(),
            detail: "command terminated by signal".into(),
        },
    }
}

/// Escape a value for embedding in an LDAP search filter (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}

/// Auth argv and environment for one candidate URL.
///
/// LDAPI always binds SASL/EXTERNAL. On the network path, SIMPLE bind
/// requires both a DN and a password; client-certificate auth requires
/// both the certificate and the key, exported to the CLI via the
/// `LDAPTLS_*` environment.
fn auth_args(params: &LdapConnParams, url: &str) -> Result<(Vec<String>, Vec<(String, String)>)> {
    let mut env = Vec::new();
    if url.starts_with("ldapi://") {
        return Ok((vec!["-Y".into(), "EXTERNAL".into()], env));
    }
    if let Some(ca) = &params.tls_ca {
        env.push(("LDAPTLS_CACERT".to_string(), ca.display().to_string()));
    }
    match params.bind_method {
        BindMethod::Simple => {
            let (dn, pw) = match (&params.bind_dn, &params.bind_pw) {
                (Some(dn), Some(pw)) => (dn, pw),
                (None, _) => {
                    return Err(LdapError::Validation {
                        hint: "SIMPLE bind requires bind_dn".into(),
                    })
                }
                (_, None) => {
                    return Err(LdapError::Validation {
                        hint: "SIMPLE bind requires bind_pw".into(),
                    })
                }
            };
            Ok((
                vec!["-x".into(), "-D".into(), dn.clone(), "-w".into(), pw.clone()],
                env,
            ))
        }
        BindMethod::SslClientAuth => {
            let (cert, key) = match (&params.tls_client_cert, &params.tls_client_key) {
                (Some(cert), Some(key)) => (cert, key),
                (None, _) => {
                    return Err(LdapError::Validation {
                        hint: "sslclientauth requires tls_client_cert".into(),
                    })
                }
                (_, None) => {
                    return Err(LdapError::Validation {
                        hint: "sslclientauth requires tls_client_key".into(),
                    })
                }
            };
            env.push(("LDAPTLS_CERT".to_string(), cert.display().to_string()));
            env.push(("LDAPTLS_KEY".to_string(), key.display().to_string()));
            Ok((vec!["-Y".into(), "EXTERNAL".into()], env))
        }
    }
}

#[async_trait]
impl DirectoryOps for LdapClient {
    async fn search_one(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Entry> {
        let mut argv = self.base_search_argv();
        argv.extend(
            ["-s", scope.as_arg(), "-b", base, filter]
                .iter()
                .map(|s| s.to_string()),
        );
        argv.extend(attrs.iter().map(|s| s.to_string()));
        let stdout = self
            .retry
            .run("search_one", || async { self.run_cli(&argv, None, base).await })
            .await?;
        ldif::parse_single_entry(&stdout).ok_or_else(|| LdapError::NotFound {
            dn: base.to_string(),
        })
    }

    async fn search(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<Entry>> {
        let mut argv = self.base_search_argv();
        argv.extend(
            ["-s", scope.as_arg(), "-b", base, filter]
                .iter()
                .map(|s| s.to_string()),
        );
        argv.extend(attrs.iter().map(|s| s.to_string()));
        let stdout = self
            .retry
            .run("search", || async { self.run_cli(&argv, None, base).await })
            .await?;
        Ok(ldif::parse_entries(&stdout))
    }

    async fn add(&self, dn: &str, attrs: &[(String, Vec<String>)]) -> Result<()> {
        let mut ldif_text = format!("dn: {dn}\nchangetype: add\n");
        for (attr, values) in attrs {
            for v in values {
                ldif_text.push_str(&format!("{attr}: {v}\n"));
            }
        }
        ldif_text.push('\n');
        let mut argv = self.write_argv("ldapmodify");
        argv.push("-a".to_string());
        self.retry
            .run("add", || async {
                self.run_cli(&argv, Some(&ldif_text), dn).await
            })
            .await
            .map(|_| ())
    }

    async fn modify(&self, dn: &str, changes: &[ModifyOp]) -> Result<()> {
        let mut ldif_text = format!("dn: {dn}\nchangetype: modify\n");
        for change in changes {
            change.render(&mut ldif_text);
        }
        ldif_text.push('\n');
        let argv = self.write_argv("ldapmodify");
        self.retry
            .run("modify", || async {
                self.run_cli(&argv, Some(&ldif_text), dn).await
            })
            .await
            .map(|_| ())
    }

    async fn delete(&self, dn: &str) -> Result<()> {
        let mut argv = self.write_argv("ldapdelete");
        argv.push(dn.to_string());
        self.retry
            .run("delete", || async { self.run_cli(&argv, None, dn).await })
            .await
            .map(|_| ())
    }
}
