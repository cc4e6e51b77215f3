//! Connection parameter normalization
//!
//! A connect request may carry several candidate hosts per hop. Before an
//! attempt starts the lists are filtered for the requested IP family and
//! collapsed to a single host each, so the rest of the engine only ever deals
//! with one entry and at most one exit host.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::seq::IndexedRandom;

use warden_proto::servers::HostInfo;
use warden_proto::types::{AccountStatus, ConnectionParams, VpnType};

use crate::error::{Error, Result};

/// Validate `params` against the account and reduce both host lists to one host
///
/// `can_fix_multihop` is set by the auto-connect path: a multihop request from
/// an account without the capability is downgraded to single hop instead of
/// failing.
pub fn normalize(
    params: &ConnectionParams,
    account: &AccountStatus,
    can_fix_multihop: bool,
) -> Result<ConnectionParams> {
    let mut params = params.clone();

    if params.entry_hosts().is_empty() {
        return Err(Error::InvalidArgument("no hosts defined for the connection".into()));
    }

    if params.is_multihop() && !account.can_connect_multihop() {
        if !can_fix_multihop {
            return Err(Error::MultihopNotAllowed);
        }
        log::warn!("Multihop is not allowed for the account; connecting single hop");
        params.exit_hosts_mut().clear();
    }

    let use_ipv6 = params.ipv6 || params.ipv6_only;

    let entry = select_host(params.entry_hosts(), "entry", |h| {
        !use_ipv6 || h.ipv6_local_ip().is_some()
    });
    let entry = match entry {
        Some(host) => host,
        None if params.ipv6_only => {
            return Err(Error::InvalidArgument(
                "none of the entry hosts supports IPv6".into(),
            ))
        }
        None => {
            // IPv6 is optional here; fall back to any host and drop IPv6
            log::info!("No IPv6-capable entry host; connecting over IPv4 only");
            params.ipv6 = false;
            select_host(params.entry_hosts(), "entry", |_| true)
                .ok_or_else(|| Error::InvalidArgument("no hosts defined for the connection".into()))?
        }
    };
    validate_host(&params, &entry)?;
    *params.entry_hosts_mut() = vec![entry];

    if params.is_multihop() {
        let exit = select_host(params.exit_hosts(), "exit", |h| {
            h.multihop_port != 0 && (!use_ipv6 || h.ipv6_local_ip().is_some())
        })
        .ok_or_else(|| {
            Error::InvalidArgument(if use_ipv6 {
                "none of the exit hosts supports multihop over IPv6".into()
            } else {
                "none of the exit hosts supports multihop".into()
            })
        })?;
        validate_host(&params, &exit)?;
        *params.exit_hosts_mut() = vec![exit];
    }

    Ok(params)
}

fn select_host(hosts: &[HostInfo], hop: &str, accept: impl Fn(&HostInfo) -> bool) -> Option<HostInfo> {
    let candidates: Vec<&HostInfo> = hosts.iter().filter(|h| accept(h)).collect();
    let host = candidates.choose(&mut rand::rng()).map(|h| (*h).clone());
    if let Some(host) = &host {
        if hosts.len() > 1 {
            log::debug!("Selected {} host {} of {}", hop, host.hostname, hosts.len());
        }
    }
    host
}

fn validate_host(params: &ConnectionParams, host: &HostInfo) -> Result<()> {
    if host.ip().is_none() {
        return Err(Error::InvalidArgument(format!(
            "invalid host address '{}'",
            host.host
        )));
    }
    if params.vpn_type == VpnType::WTunnel {
        let key = BASE64
            .decode(host.public_key.trim())
            .map_err(|_| Error::InvalidArgument(format!("invalid public key for {}", host.hostname)))?;
        if key.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "empty public key for {}",
                host.hostname
            )));
        }
    }
    Ok(())
}
