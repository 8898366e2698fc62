use dns_lookup::lookup_host;
use std::net::IpAddr;

use crate::error::PingError;
use crate::icmp::IpFamily;

/// Resolves `hostname` to one address, restricted to `family` when given.
///
/// Address literals are accepted as-is if they match the family. With no
/// family preference IPv4 is preferred.
pub async fn resolve_hostname(hostname: &str, family: Option<IpFamily>) -> Result<IpAddr, PingError> {
    let resolution_error = |reason: String| PingError::Resolution {
        host: hostname.to_string(),
        reason,
    };

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return match family {
            Some(want) if IpFamily::of(&ip) != want => {
                Err(resolution_error(format!("address literal is not {}", want)))
            }
            _ => Ok(ip),
        };
    }

    let addresses = tokio::task::spawn_blocking({
        let hostname = hostname.to_string();
        move || lookup_host(&hostname)
    })
    .await
    .map_err(|e| resolution_error(e.to_string()))?
    .map_err(|e| resolution_error(e.to_string()))?;

    log::debug!("{} resolved to {:?}", hostname, addresses);
    select_address(&addresses, family).ok_or_else(|| match family {
        Some(want) => resolution_error(format!("no {} address found", want)),
        None => resolution_error("no addresses found".to_string()),
    })
}

fn select_address(addresses: &[IpAddr], family: Option<IpFamily>) -> Option<IpAddr> {
    let want = family.unwrap_or(IpFamily::V4);
    let preferred = addresses.iter().find(|addr| IpFamily::of(addr) == want).copied();

    match family {
        Some(_) => preferred,
        None => preferred.or_else(|| addresses.first().copied()),
    }
}
