use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, Result};
use ipnet::IpNet;
use lazy_static::lazy_static;
use regex::Regex;

/// Upper bound on hosts a single range or CIDR block may expand to.
const MAX_EXPANSION: usize = 10_000;

lazy_static! {
    static ref HOSTNAME: Regex =
        Regex::new(r"^(?i)[a-z0-9_]([a-z0-9_-]{0,61}[a-z0-9])?(\.[a-z0-9_]([a-z0-9_-]{0,61}[a-z0-9])?)*\.?$")
            .expect("valid hostname pattern");
}

/// Expands a comma separated target list into probe hosts. Hostnames are
/// kept as given so resolution happens inside each probe's deadline.
/// Order is preserved and duplicates dropped.
pub fn parse_targets(target_spec: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for part in target_spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let hosts = if part.contains('/') {
            parse_cidr(part)?
        } else if let Some(range) = as_ip_range(part) {
            parse_ip_range(range)?
        } else {
            vec![parse_single_target(part)?]
        };
        for host in hosts {
            if seen.insert(host.clone()) {
                targets.push(host);
            }
        }
    }

    if targets.is_empty() {
        return Err(anyhow!("no targets given"));
    }
    Ok(targets)
}

fn parse_cidr(cidr: &str) -> Result<Vec<String>> {
    let network: IpNet = cidr
        .parse()
        .map_err(|_| anyhow!("Invalid CIDR notation: {}", cidr))?;

    let hosts: Vec<String> = match network {
        IpNet::V4(net) => net.hosts().take(MAX_EXPANSION + 1).map(|ip| ip.to_string()).collect(),
        IpNet::V6(net) => net.hosts().take(MAX_EXPANSION + 1).map(|ip| ip.to_string()).collect(),
    };
    if hosts.len() > MAX_EXPANSION {
        return Err(anyhow!("CIDR block {} too large (max {} addresses)", cidr, MAX_EXPANSION));
    }
    Ok(hosts)
}

/// `a.b.c.d-e.f.g.h`; anything else with a dash is a hostname.
fn as_ip_range(part: &str) -> Option<(IpAddr, IpAddr)> {
    let (start, end) = part.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

fn parse_ip_range(range: (IpAddr, IpAddr)) -> Result<Vec<String>> {
    match range {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            let start_u32 = u32::from(start);
            let end_u32 = u32::from(end);

            if start_u32 > end_u32 {
                return Err(anyhow!("Start IP must be less than or equal to end IP"));
            }
            if (end_u32 - start_u32) as usize >= MAX_EXPANSION {
                return Err(anyhow!("IP range too large (max {} addresses)", MAX_EXPANSION));
            }

            Ok((start_u32..=end_u32).map(|ip| Ipv4Addr::from(ip).to_string()).collect())
        }
        (IpAddr::V6(_), IpAddr::V6(_)) => Err(anyhow!("IPv6 ranges not supported; use CIDR notation")),
        _ => Err(anyhow!("Start and end IP must be the same version")),
    }
}

fn parse_single_target(target: &str) -> Result<String> {
    let bare = target.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    if target.len() <= 253 && HOSTNAME.is_match(target) {
        return Ok(target.to_ascii_lowercase());
    }
    Err(anyhow!("Invalid target: {}", target))
}
