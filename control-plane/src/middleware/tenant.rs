//! Maps the request host to an organization.

use service_core::error::AppError;

use crate::data::{optional, Transaction};
use crate::models::Organization;

/// Strips a trailing `:port`, leaving bracketed IPv6 literals intact.
fn without_port(host: &str) -> Option<&str> {
    let (name, port) = host.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) || name.ends_with(':') {
        return None;
    }
    Some(name)
}

/// Looks the host up as a domain, then once more without its port. When
/// nothing matches, `fallback` (the default organization of a single-tenant
/// deployment) applies.
pub async fn from_host(
    tx: &mut dyn Transaction,
    host: Option<&str>,
    fallback: Option<&Organization>,
) -> Result<Option<Organization>, AppError> {
    if let Some(host) = host.map(|h| h.trim().to_lowercase()).filter(|h| !h.is_empty()) {
        if let Some(org) = optional(tx.get_organization_by_domain(&host).await)? {
            return Ok(Some(org));
        }
        if let Some(name) = without_port(&host) {
            if let Some(org) = optional(tx.get_organization_by_domain(name).await)? {
                return Ok(Some(org));
            }
        }
    }
    Ok(fallback.cloned())
}

/// Picks the organization for a request from the host and the access key.
/// When both name one, they must agree.
pub fn reconcile(from_host: Option<Organization>, from_key: Organization) -> Result<Organization, AppError> {
    match from_host {
        Some(host_org) if host_org.id != from_key.id => {
            tracing::debug!(
                host_org = %host_org.id,
                key_org = %from_key.id,
                "Access key used against another organization"
            );
            Err(AppError::bad_request("access key is not valid for this organization"))
        }
        _ => Ok(from_key),
    }
}
