use std::net::IpAddr;

/// Marker between the namespace and the identity part of a rule name.
pub const RULE_NAME_MARKER: &str = "_Block_";

/// Builds the deterministic firewall rule name for a process/address pair:
/// `<namespace>_Block_<processName>_<remoteAddress>`.
pub fn format_rule_name(namespace: &str, process_name: &str, remote_address: &str) -> String {
    format!(
        "{}{}{}_{}",
        namespace,
        RULE_NAME_MARKER,
        sanitize_rule_component(process_name),
        remote_address
    )
}

/// Prefix shared by every rule this service owns.
pub fn rule_name_prefix(namespace: &str) -> String {
    format!("{}{}", namespace, RULE_NAME_MARKER)
}

/// Inverse of [`format_rule_name`]. The address is whatever follows the last
/// underscore, so process names containing underscores survive the round trip.
pub fn parse_rule_name(namespace: &str, name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix(&rule_name_prefix(namespace))?;
    let (process, address) = rest.rsplit_once('_')?;
    if process.is_empty() || address.parse::<IpAddr>().is_err() {
        return None;
    }
    Some((process.to_string(), address.to_string()))
}

fn sanitize_rule_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '"' || c.is_whitespace() { '-' } else { c })
        .collect()
}

/// Loopback, link-local and RFC1918 / unique-local ranges.
pub fn is_private_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || v6.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}
