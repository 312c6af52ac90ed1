//! IP allowlist checks.
//!
//! The effective allowlist is the union of the process-level list and a
//! key's own list. Entries are single addresses or CIDR blocks; entries
//! that fail to parse are skipped at check time. An empty union means
//! unrestricted.

use std::net::IpAddr;

use tracing::trace;

/// Check a client IP against the union of two allowlists.
pub fn ip_allowed(global: &[String], per_key: &[String], client_ip: &str) -> bool {
    let union_len = global.len() + per_key.len();
    if union_len == 0 {
        return true;
    }
    let Ok(client) = client_ip.parse::<IpAddr>() else {
        // Restricted key + unparseable caller address: reject.
        return false;
    };
    global
        .iter()
        .chain(per_key.iter())
        .any(|entry| entry_matches(entry, client))
}

fn entry_matches(entry: &str, client: IpAddr) -> bool {
    match entry.split_once('/') {
        None => entry.parse::<IpAddr>().is_ok_and(|ip| ip == client),
        Some((base, prefix)) => {
            let (Ok(base), Ok(prefix)) = (base.parse::<IpAddr>(), prefix.parse::<u8>()) else {
                trace!(entry, "skipping unparseable allowlist entry");
                return false;
            };
            cidr_contains(base, prefix, client)
        }
    }
}

fn cidr_contains(base: IpAddr, prefix: u8, client: IpAddr) -> bool {
    match (base, client) {
        (IpAddr::V4(base), IpAddr::V4(client)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            u32::from_be_bytes(base.octets()) & mask == u32::from_be_bytes(client.octets()) & mask
        }
        (IpAddr::V6(base), IpAddr::V6(client)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            u128::from_be_bytes(base.octets()) & mask == u128::from_be_bytes(client.octets()) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_union_is_unrestricted() {
        assert!(ip_allowed(&[], &[], "10.0.0.1"));
        assert!(ip_allowed(&[], &[], "not-an-ip"));
    }

    #[test]
    fn exact_match_entries() {
        let global = list(&["10.0.0.1"]);
        assert!(ip_allowed(&global, &[], "10.0.0.1"));
        assert!(!ip_allowed(&global, &[], "10.0.0.2"));
    }

    #[test]
    fn cidr_entries_match_their_block() {
        let per_key = list(&["192.168.1.0/24"]);
        assert!(ip_allowed(&[], &per_key, "192.168.1.200"));
        assert!(!ip_allowed(&[], &per_key, "192.168.2.1"));
    }

    #[test]
    fn union_of_global_and_per_key() {
        let global = list(&["10.0.0.0/8"]);
        let per_key = list(&["203.0.113.7"]);
        assert!(ip_allowed(&global, &per_key, "10.20.30.40"));
        assert!(ip_allowed(&global, &per_key, "203.0.113.7"));
        assert!(!ip_allowed(&global, &per_key, "203.0.113.8"));
    }

    #[test]
    fn invalid_entries_are_skipped_not_fatal() {
        let global = list(&["garbage", "300.1.1.1", "10.0.0.0/40", "10.0.0.1"]);
        assert!(ip_allowed(&global, &[], "10.0.0.1"));
        assert!(!ip_allowed(&global, &[], "10.0.0.2"));
    }

    #[test]
    fn ipv6_cidr_blocks() {
        let global = list(&["2001:db8::/32"]);
        assert!(ip_allowed(&global, &[], "2001:db8::1"));
        assert!(!ip_allowed(&global, &[], "2001:db9::1"));
    }

    #[test]
    fn zero_prefix_matches_everything_in_family() {
        let global = list(&["0.0.0.0/0"]);
        assert!(ip_allowed(&global, &[], "255.255.255.255"));
        assert!(!ip_allowed(&global, &[], "::1"));
    }

    #[test]
    fn restricted_list_rejects_unparseable_client() {
        let global = list(&["10.0.0.1"]);
        assert!(!ip_allowed(&global, &[], "unknown"));
    }
}
