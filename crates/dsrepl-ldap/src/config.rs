//! Connection parameters and URL selection for one directory instance.
//!
//! LDAPI over the instance socket (SASL/EXTERNAL, no secrets) is always
//! preferred when enabled; both the host-systemd and container socket
//! layouts are probed. LDAPS is the explicit network fallback.

use std::path::PathBuf;
use std::time::Duration;

/// Default connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-operation timeout.
pub const OP_TIMEOUT: Duration = Duration::from_secs(30);

/// How to authenticate over the network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMethod {
    /// SIMPLE bind with a DN and password.
    Simple,
    /// Client-certificate auth (SASL/EXTERNAL over TLS).
    SslClientAuth,
}

/// Parameters for opening a session against one 389-DS instance.
#[derive(Debug, Clone)]
pub struct LdapConnParams {
    /// Instance name, e.g. `localhost` for `slapd-localhost`.
    pub instance: String,
    /// Prefer LDAPI + SASL/EXTERNAL for the local instance.
    pub use_ldapi: bool,
    /// Hostname for the LDAPS fallback path.
    pub ldaps_host: Option<String>,
    /// Port for the LDAPS fallback path.
    pub ldaps_port: u16,
    /// Bind method used on the network path.
    pub bind_method: BindMethod,
    /// Bind DN for SIMPLE bind.
    pub bind_dn: Option<String>,
    /// Password for SIMPLE bind.
    pub bind_pw: Option<String>,
    /// CA bundle used to validate the server certificate.
    pub tls_ca: Option<PathBuf>,
    /// Client certificate for `SslClientAuth`.
    pub tls_client_cert: Option<PathBuf>,
    /// Client private key for `SslClientAuth`.
    pub tls_client_key: Option<PathBuf>,
    /// TCP/socket connect timeout.
    pub connect_timeout: Duration,
    /// Per-operation timeout.
    pub op_timeout: Duration,
}

impl LdapConnParams {
    /// Parameters for a local instance reachable over LDAPI only.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            use_ldapi: true,
            ldaps_host: None,
            ldaps_port: 636,
            bind_method: BindMethod::Simple,
            bind_dn: None,
            bind_pw: None,
            tls_ca: None,
            tls_client_cert: None,
            tls_client_key: None,
            connect_timeout: CONNECT_TIMEOUT,
            op_timeout: OP_TIMEOUT,
        }
    }

    /// Candidate URLs in priority order: LDAPI sockets first, then LDAPS.
    pub fn candidate_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if self.use_ldapi {
            // Host systemd layout, then the container default.
            urls.push(ldapi_url(&self.instance, "/run"));
            urls.push(ldapi_url(&self.instance, "/data/run"));
        }
        if let Some(host) = &self.ldaps_host {
            urls.push(format!("ldaps://{}:{}", host, self.ldaps_port));
        }
        urls
    }
}

/// Percent-encoded LDAPI URL for the instance socket under `base_dir`.
///
/// `ldapi_url("example", "/run")` yields
/// `ldapi://%2Frun%2Fslapd-example.socket`.
pub fn ldapi_url(instance: &str, base_dir: &str) -> String {
    let socket_path = format!("{base_dir}/slapd-{instance}.socket");
    format!("ldapi://{}", socket_path.replace('/', "%2F"))
}
