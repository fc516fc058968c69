//! KDL configuration parsing.

mod helpers;

pub use helpers::{get_bool_entry, get_int_entry, get_string_entry, offset_to_line_col};

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{trace, warn};

use crate::{default_certs_dir, default_listen_address, default_renew_before_days, RenewalConfig};

/// Child node names accepted inside the `acme` block
const KNOWN_KEYS: &[&str] = &[
    "domain",
    "email",
    "staging",
    "force-new-certificate",
    "force-renew",
    "certs-dir",
    "listen-address",
    "renew-before-days",
    "account-credentials",
];

/// Build a [`RenewalConfig`] from a parsed KDL document
///
/// The document must contain a top-level `acme { ... }` block.
pub fn parse_kdl_document(doc: &kdl::KdlDocument) -> Result<RenewalConfig> {
    let node = doc.get("acme").ok_or_else(|| {
        anyhow::anyhow!("Configuration requires an 'acme' block, e.g., acme {{ domain \"example.org\" }}")
    })?;

    trace!("Parsing acme configuration block");

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value();
            if !KNOWN_KEYS.contains(&name) {
                warn!(key = %name, "Ignoring unknown key in acme block");
            }
        }
    }

    let domain = get_string_entry(node, "domain")?.ok_or_else(|| {
        anyhow::anyhow!("acme block requires a 'domain' field, e.g., domain \"example.org\"")
    })?;
    let email = get_string_entry(node, "email")?.ok_or_else(|| {
        anyhow::anyhow!("acme block requires an 'email' field, e.g., email \"admin@example.org\"")
    })?;

    let listen_address = match get_string_entry(node, "listen-address")? {
        Some(addr) => addr
            .parse()
            .with_context(|| format!("Invalid listen-address '{}'", addr))?,
        None => default_listen_address(),
    };

    let renew_before_days = match get_int_entry(node, "renew-before-days")? {
        Some(days) => u32::try_from(days)
            .map_err(|_| anyhow::anyhow!("renew-before-days out of range: {}", days))?,
        None => default_renew_before_days(),
    };

    let config = RenewalConfig {
        domain,
        email,
        staging: get_bool_entry(node, "staging")?.unwrap_or(false),
        force_new_certificate: get_bool_entry(node, "force-new-certificate")?.unwrap_or(false),
        force_renew: get_bool_entry(node, "force-renew")?.unwrap_or(false),
        certs_dir: get_string_entry(node, "certs-dir")?
            .map(PathBuf::from)
            .unwrap_or_else(default_certs_dir),
        listen_address,
        renew_before_days,
        account_credentials: get_string_entry(node, "account-credentials")?.map(PathBuf::from),
    };

    trace!(
        domain = %config.domain,
        staging = config.staging,
        certs_dir = %config.certs_dir.display(),
        "Parsed acme configuration"
    );

    Ok(config)
}
