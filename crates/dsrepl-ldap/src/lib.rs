#![warn(missing_docs)]

//! dsrepl LDAP access layer: scoped sessions against one 389-DS instance,
//! LDAPI (SASL/EXTERNAL) first with LDAPS fallback, bounded retries.

pub mod client;
pub mod config;
pub mod error;
pub mod ldif;
pub mod retry;
