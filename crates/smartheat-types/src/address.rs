//! Link addressing: mapping thermostat MAC addresses to network addresses.
//!
//! Thermostats sit behind a 6LoWPAN border router that derives each node's
//! IPv6 address from its link-layer address. The mapping is a pure function:
//! the MAC's hex digits are grouped into 16-bit segments and appended to the
//! border router prefix.
//!
//! ```
//! use smartheat_types::DeviceAddress;
//!
//! let address = DeviceAddress::from_mac("2e:ff:ff:00:22:8b").unwrap();
//! assert_eq!(address.to_string(), "fdfd::221:2eff:ff00:228b");
//! ```

use core::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Default border router prefix, in `network::interface` form.
pub const DEFAULT_LINK_PREFIX: &str = "fdfd::221";

/// Default CoAP port.
pub const DEFAULT_COAP_PORT: u16 = 5683;

/// Number of octets in an EUI-48 MAC.
const EUI48_OCTETS: usize = 6;
/// Number of octets in an EUI-64 MAC.
const EUI64_OCTETS: usize = 8;

/// The border router prefix used to build device addresses.
///
/// A prefix is written like a compressed IPv6 address, e.g. `fdfd::221`. The
/// segments before `::` are placed at the front of the address, the segments
/// after it directly before the MAC-derived segments.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct LinkPrefix {
    network: Vec<u16>,
    interface: Vec<u16>,
}

impl LinkPrefix {
    fn segment_count(&self) -> usize {
        self.network.len() + self.interface.len()
    }
}

impl Default for LinkPrefix {
    fn default() -> Self {
        Self {
            network: vec![0xfdfd],
            interface: vec![0x0221],
        }
    }
}

impl FromStr for LinkPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, interface) = s
            .split_once("::")
            .ok_or_else(|| format!("prefix '{}' must contain '::'", s))?;

        fn segments(part: &str) -> Result<Vec<u16>, String> {
            if part.is_empty() {
                return Ok(Vec::new());
            }
            part.split(':')
                .map(|seg| {
                    u16::from_str_radix(seg, 16)
                        .map_err(|_| format!("invalid prefix segment '{}'", seg))
                })
                .collect()
        }

        let prefix = Self {
            network: segments(network)?,
            interface: segments(interface)?,
        };

        // Room for the longest MAC (4 segments) plus at least one zero segment.
        if prefix.segment_count() > 3 {
            return Err(format!("prefix '{}' leaves no room for an EUI-64", s));
        }

        Ok(prefix)
    }
}

impl TryFrom<String> for LinkPrefix {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LinkPrefix> for String {
    fn from(prefix: LinkPrefix) -> Self {
        prefix.to_string()
    }
}

impl fmt::Display for LinkPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |segs: &[u16]| {
            segs.iter()
                .map(|s| format!("{:x}", s))
                .collect::<Vec<_>>()
                .join(":")
        };
        write!(f, "{}::{}", join(&self.network), join(&self.interface))
    }
}

/// Network address of a thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(IpAddr);

impl DeviceAddress {
    /// Map a MAC address to its device address using the default prefix.
    pub fn from_mac(mac: &str) -> Result<Self, AddressError> {
        Self::from_mac_with_prefix(mac, &LinkPrefix::default())
    }

    /// Map a MAC address to its device address under `prefix`.
    ///
    /// Accepts EUI-48 and EUI-64 MACs written as colon-separated hex octets,
    /// case-insensitively.
    pub fn from_mac_with_prefix(mac: &str, prefix: &LinkPrefix) -> Result<Self, AddressError> {
        let octets = parse_mac(mac)?;

        let mut segments = [0u16; 8];
        for (i, seg) in prefix.network.iter().enumerate() {
            segments[i] = *seg;
        }

        let mac_segments: Vec<u16> = octets
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();

        let tail: Vec<u16> = prefix
            .interface
            .iter()
            .copied()
            .chain(mac_segments)
            .collect();
        if prefix.network.len() + tail.len() > segments.len() {
            return Err(AddressError::new(mac, "does not fit under the link prefix"));
        }
        let start = segments.len() - tail.len();
        segments[start..].copy_from_slice(&tail);

        Ok(Self(IpAddr::V6(Ipv6Addr::from(segments))))
    }

    /// The underlying IP address.
    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// Socket address of the device's CoAP endpoint.
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.0, port)
    }

    /// `coap://` URI of the device, as used in request logs.
    pub fn uri(&self) -> String {
        match self.0 {
            IpAddr::V6(ip) => format!("coap://[{}]", ip),
            IpAddr::V4(ip) => format!("coap://{}", ip),
        }
    }
}

impl From<IpAddr> for DeviceAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn parse_mac(mac: &str) -> Result<Vec<u8>, AddressError> {
    let trimmed = mac.trim();
    if trimmed.is_empty() {
        return Err(AddressError::new(mac, "empty"));
    }

    let octets = trimmed
        .split(':')
        .map(|part| {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(AddressError::new(
                    mac,
                    format!("octet '{}' must be two hex digits", part),
                ));
            }
            u8::from_str_radix(part, 16)
                .map_err(|_| AddressError::new(mac, format!("octet '{}' is not hex", part)))
        })
        .collect::<Result<Vec<u8>, _>>()?;

    match octets.len() {
        EUI48_OCTETS | EUI64_OCTETS => Ok(octets),
        n => Err(AddressError::new(
            mac,
            format!("expected 6 or 8 octets, got {}", n),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_known_mapping() {
        let address = DeviceAddress::from_mac("2e:ff:ff:00:22:8b").unwrap();
        assert_eq!(address.to_string(), "fdfd::221:2eff:ff00:228b");
        assert_eq!(address.uri(), "coap://[fdfd::221:2eff:ff00:228b]");
    }

    #[test]
    fn test_case_insensitive() {
        let lower = DeviceAddress::from_mac("2e:ff:ff:00:22:8b").unwrap();
        let upper = DeviceAddress::from_mac("2E:FF:FF:00:22:8B").unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_eui64() {
        let address = DeviceAddress::from_mac("00:12:4b:00:06:0d:b5:f4").unwrap();
        assert_eq!(address.to_string(), "fdfd::221:12:4b00:60d:b5f4");
    }

    #[test]
    fn test_eui48_and_eui64_never_collide() {
        let short = DeviceAddress::from_mac("02:21:00:00:00:01").unwrap();
        let long = DeviceAddress::from_mac("00:00:02:21:00:00:00:01").unwrap();
        assert_ne!(short, long);
    }

    #[test]
    fn test_malformed_macs() {
        for mac in [
            "",
            "2e:ff:ff:00:22",
            "2e:ff:ff:00:22:8b:01",
            "2e-ff-ff-00-22-8b",
            "2e:ff:ff:00:22:zz",
            "2e:ff:ff:00:22:8",
            "2eff:ff00:228b",
        ] {
            let err = DeviceAddress::from_mac(mac).unwrap_err();
            assert_eq!(err.mac, mac);
        }
    }

    #[test]
    fn test_socket_addr() {
        let address = DeviceAddress::from_mac("2e:ff:ff:00:22:8b").unwrap();
        assert_eq!(address.socket_addr(DEFAULT_COAP_PORT).port(), 5683);
    }

    #[test]
    fn test_prefix_parse_and_display() {
        let prefix: LinkPrefix = DEFAULT_LINK_PREFIX.parse().unwrap();
        assert_eq!(prefix, LinkPrefix::default());
        assert_eq!(prefix.to_string(), "fdfd::221");

        assert!("fdfd:221".parse::<LinkPrefix>().is_err());
        assert!("fdfd:1:2::3".parse::<LinkPrefix>().is_err());
        assert!("fdfd::zz".parse::<LinkPrefix>().is_err());
    }

    #[test]
    fn test_custom_prefix() {
        let prefix: LinkPrefix = "fd00::1".parse().unwrap();
        let address = DeviceAddress::from_mac_with_prefix("2e:ff:ff:00:22:8b", &prefix).unwrap();
        assert_eq!(address.to_string(), "fd00::1:2eff:ff00:228b");
    }

    fn mac_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 6),
            proptest::collection::vec(any::<u8>(), 8),
        ]
        .prop_map(|octets| {
            octets
                .iter()
                .map(|o| format!("{:02x}", o))
                .collect::<Vec<_>>()
                .join(":")
        })
    }

    proptest! {
        #[test]
        fn prop_mapping_is_deterministic(mac in mac_strategy()) {
            let first = DeviceAddress::from_mac(&mac).unwrap();
            let second = DeviceAddress::from_mac(&mac).unwrap();
            prop_assert_eq!(first, second);
            prop_assert_eq!(DeviceAddress::from_mac(&mac.to_uppercase()).unwrap(), first);
        }

        #[test]
        fn prop_mapping_is_injective(macs in proptest::collection::hash_set(mac_strategy(), 1..64)) {
            let addresses: HashSet<DeviceAddress> = macs
                .iter()
                .map(|mac| DeviceAddress::from_mac(mac).unwrap())
                .collect();
            prop_assert_eq!(addresses.len(), macs.len());
        }
    }
}
