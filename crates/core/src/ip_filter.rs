//! The IP access predicate (§4.1).
//!
//! Precedence is the resolved ambiguity from §9: `order_allow_deny = true`
//! means deny wins on overlap; `false` means allow wins. Short-form ranges
//! (`"10.1."`) are `convert_short_ip_to_subnet` from
//! `examples/original_source/rtl_mus.py` ported to `Ipv4Net`.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;

use crate::config::Config;

/// A pure predicate over a client's source address (§4.1, §8: "The IP
/// filter is a pure function of (ip, config)").
#[derive(Debug, Clone)]
pub struct IpAccessFilter {
    enabled: bool,
    order_allow_deny: bool,
    allowed: Vec<IpNet>,
    denied: Vec<IpNet>,
}

/// A malformed entry in `allowed_ranges` / `denied_ranges`.
#[derive(Debug, thiserror::Error)]
#[error("invalid IP range {0:?}")]
pub struct InvalidRange(String);

impl IpAccessFilter {
    /// Builds a filter from the access-control fields of [`Config`].
    ///
    /// Empty range lists default to `0.0.0.0/0` (§4.1).
    pub fn from_config(config: &Config) -> Result<Self, InvalidRange> {
        Ok(Self {
            enabled: config.use_ip_access_control,
            order_allow_deny: config.order_allow_deny,
            allowed: parse_ranges(&config.allowed_ranges)?,
            denied: parse_ranges(&config.denied_ranges)?,
        })
    }

    /// Evaluates the predicate from §4.1 for one address.
    #[must_use]
    pub fn allowed(&self, ip: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        let a = self.allowed.iter().any(|net| net.contains(&ip));
        let d = self.denied.iter().any(|net| net.contains(&ip));
        if self.order_allow_deny {
            !d && a
        } else {
            a || !d
        }
    }
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<IpNet>, InvalidRange> {
    if ranges.is_empty() {
        // "empty range lists default to 0.0.0.0/0" (§4.1).
        let everything = IpNet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            .expect("0.0.0.0/0 is always a valid network");
        return Ok(vec![everything]);
    }
    ranges.iter().map(|s| parse_range(s)).collect()
}

fn parse_range(range: &str) -> Result<IpNet, InvalidRange> {
    if let Ok(net) = range.parse::<IpNet>() {
        return Ok(net);
    }
    // Plain addresses (`"10.1.2.3"`, no prefix) parse as host routes.
    if let Ok(addr) = range.parse::<IpAddr>() {
        let bits = if addr.is_ipv4() { 32 } else { 128 };
        return Ok(IpNet::new(addr, bits).expect("host prefix is always valid"));
    }
    short_form_to_cidr(range).ok_or_else(|| InvalidRange(range.to_owned()))
}

/// Ports `convert_short_ip_to_subnet` from `rtl_mus.py`: `"10.1."` (or
/// `"10.1"`) becomes the CIDR block whose prefix length is the number of
/// octets supplied times 8, e.g. `10.1.0.0/16`.
fn short_form_to_cidr(range: &str) -> Option<IpNet> {
    let trimmed = range.strip_suffix('.').unwrap_or(range);
    let octets: Vec<&str> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('.').collect()
    };
    if octets.len() > 4 {
        return None;
    }
    let prefix_len = u8::try_from(octets.len() * 8).ok()?;
    let mut parts = [0u8; 4];
    for (slot, text) in parts.iter_mut().zip(octets.iter()) {
        *slot = text.parse().ok()?;
    }
    let addr = Ipv4Addr::from(parts);
    IpNet::new(IpAddr::V4(addr), prefix_len).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::base_config;

    fn filter(enabled: bool, order_allow_deny: bool, allowed: &[&str], denied: &[&str]) -> IpAccessFilter {
        let mut config = base_config();
        config.use_ip_access_control = enabled;
        config.order_allow_deny = order_allow_deny;
        config.allowed_ranges = allowed.iter().map(|s| (*s).to_owned()).collect();
        config.denied_ranges = denied.iter().map(|s| (*s).to_owned()).collect();
        IpAccessFilter::from_config(&config).unwrap()
    }

    #[test]
    fn disabled_filter_allows_everything() {
        let f = filter(false, true, &[], &["0.0.0.0/0"]);
        assert!(f.allowed([1, 2, 3, 4].into()));
    }

    #[test]
    fn deny_wins_on_overlap_when_order_allow_deny_is_true() {
        let f = filter(true, true, &["0.0.0.0/0"], &["10.0.0.0/8"]);
        assert!(!f.allowed([10, 1, 2, 3].into()));
        assert!(f.allowed([192, 168, 1, 1].into()));
    }

    #[test]
    fn allow_wins_on_overlap_when_order_allow_deny_is_false() {
        let f = filter(true, false, &["10.0.0.0/8"], &["10.1.0.0/16"]);
        assert!(f.allowed([10, 1, 2, 3].into()), "allow should win the overlap");
        assert!(!f.allowed([192, 168, 1, 1].into()), "not in allow, not matched by deny => falls to !denied");
    }

    #[test]
    fn empty_range_lists_default_to_everything() {
        let f = filter(true, true, &[], &[]);
        assert!(f.allowed([8, 8, 8, 8].into()));
    }

    #[test]
    fn short_form_ranges_are_prefix_length_times_eight() {
        let f = filter(true, true, &["0.0.0.0/0"], &["10.1."]);
        assert!(!f.allowed([10, 1, 0, 5].into()));
        assert!(!f.allowed([10, 1, 255, 255].into()));
        assert!(f.allowed([10, 2, 0, 5].into()));
    }

    #[test]
    fn short_form_with_no_octets_is_the_whole_space() {
        let net = short_form_to_cidr(".").unwrap();
        assert_eq!(net.prefix_len(), 0);
    }
}
