//! Network address helpers.

use std::net::IpAddr;

/// Returns a uniquified version of an IP address for presence deduplication:
/// IPv6 addresses are masked to their /64 prefix, IPv4 addresses are left
/// untouched. Unparseable input is returned as-is.
pub fn uniquified_ip(remote_address: &str) -> String {
    let Ok(addr) = remote_address.parse::<IpAddr>() else {
        return remote_address.to_string();
    };
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let masked = std::net::Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                segments[3],
                0,
                0,
                0,
                0,
            );
            masked.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_untouched() {
        assert_eq!(uniquified_ip("192.0.2.7"), "192.0.2.7");
    }

    #[test]
    fn ipv6_masked_to_64() {
        assert_eq!(
            uniquified_ip("2001:db8:1:2:3:4:5:6"),
            "2001:db8:1:2::"
        );
        // same /64 collapses to the same value
        assert_eq!(
            uniquified_ip("2001:db8:1:2:ffff::1"),
            uniquified_ip("2001:db8:1:2::9")
        );
    }

    #[test]
    fn garbage_passes_through() {
        assert_eq!(uniquified_ip("not-an-ip"), "not-an-ip");
    }
}
