//! Address parsing shared by the topology loader and the live control
//! server's `address`/`ipaddr` fields.

use std::net::{IpAddr, Ipv4Addr};

/// Error type for address parsing.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

pub type Result<T> = std::result::Result<T, AddrError>;

/// Parse an IP address from string.
pub fn parse_addr(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| AddrError::InvalidAddress(s.to_string()))
}

/// Parse an IP address with prefix length (CIDR notation): `a.b.c.d[/prefix]`,
/// default prefix 32/128.
pub fn parse_prefix(s: &str) -> Result<(IpAddr, u8)> {
    if let Some((addr_str, prefix_str)) = s.split_once('/') {
        let addr = parse_addr(addr_str)?;
        let prefix: u8 = prefix_str
            .parse()
            .map_err(|_| AddrError::InvalidPrefix(prefix_str.to_string()))?;

        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max_prefix {
            return Err(AddrError::InvalidPrefix(format!(
                "{} exceeds maximum {} for address family",
                prefix, max_prefix
            )));
        }

        Ok((addr, prefix))
    } else {
        let addr = parse_addr(s)?;
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Ok((addr, prefix))
    }
}

/// Parse a MAC address from `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(AddrError::InvalidMac(s.to_string()));
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| AddrError::InvalidMac(s.to_string()))?;
    }

    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_parse_addr() {
        assert_eq!(
            parse_addr("192.168.1.1").unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(parse_addr("::1").unwrap(), IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_parse_prefix() {
        let (addr, prefix) = parse_prefix("192.168.1.0/24").unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)));
        assert_eq!(prefix, 24);
    }

    #[test]
    fn test_parse_prefix_defaults_to_32() {
        let (_, prefix) = parse_prefix("10.0.0.1").unwrap();
        assert_eq!(prefix, 32);
    }

    #[test]
    fn test_parse_mac() {
        let mac = parse_mac("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(mac, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn test_parse_mac_rejects_wrong_octet_count() {
        assert!(parse_mac("aa:bb:cc").is_err());
    }
}
