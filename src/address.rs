//! Mesh addresses
//!
//! Every node owns the IPv6 address `fd` followed by the first 15 bytes of
//! its public key. The mapping is one way: an address only carries a key
//! prefix, so the full key has to be learned from traffic.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::mesh::{PublicKey, PUBLIC_KEY_LEN};

/// Scope tag carried in the first byte of every mesh address
pub const ADDRESS_SCOPE: u8 = 0xfd;

/// Address length in bytes
pub const ADDRESS_LEN: usize = 16;

/// Number of key bytes embedded in an address
pub const ADDRESS_KEY_BYTES: usize = ADDRESS_LEN - 1;

/// 16-byte IPv6 mesh address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Address owned by `key`
    pub fn for_key(key: &PublicKey) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = ADDRESS_SCOPE;
        bytes[1..].copy_from_slice(&key.as_bytes()[..ADDRESS_KEY_BYTES]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Read an address from exactly 16 bytes, typically a header field
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Key(format!("address must be {} bytes, got {}", ADDRESS_LEN, bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Unverified key guess: the embedded prefix padded with zeros.
    ///
    /// Only meaningful for picking a route towards the owner; the owner's
    /// real key differs in its last 17 bytes.
    pub fn key_prefix(&self) -> PublicKey {
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes[..ADDRESS_KEY_BYTES].copy_from_slice(&self.0[1..]);
        PublicKey::from_bytes(bytes)
    }

    /// Whether `key` could own this address
    pub fn matches_key(&self, key: &PublicKey) -> bool {
        self.0[1..] == key.as_bytes()[..ADDRESS_KEY_BYTES]
    }

    pub fn is_mesh(&self) -> bool {
        self.0[0] == ADDRESS_SCOPE
    }

    /// Whether raw address bytes start with the mesh scope tag
    pub fn has_scope_tag(bytes: &[u8]) -> bool {
        bytes.first() == Some(&ADDRESS_SCOPE)
    }
}

impl From<Address> for Ipv6Addr {
    fn from(addr: Address) -> Self {
        Ipv6Addr::from(addr.0)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.octets())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv6Addr::from(*self))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Identity;

    #[test]
    fn test_address_for_key() {
        let key = Identity::from_seed(&[42u8; 32]).public_key();
        let addr = Address::for_key(&key);

        assert_eq!(addr.as_bytes()[0], ADDRESS_SCOPE);
        assert_eq!(&addr.as_bytes()[1..], &key.as_bytes()[..15]);
        assert!(addr.matches_key(&key));
        assert!(addr.is_mesh());
    }

    #[test]
    fn test_key_prefix_routes_back_to_address() {
        let key = Identity::from_seed(&[3u8; 32]).public_key();
        let addr = Address::for_key(&key);
        let guess = addr.key_prefix();

        assert_eq!(&guess.as_bytes()[..15], &key.as_bytes()[..15]);
        assert!(guess.as_bytes()[15..].iter().all(|b| *b == 0));
        assert_eq!(Address::for_key(&guess), addr);
        assert!(addr.matches_key(&guess));
    }

    #[test]
    fn test_matches_key_rejects_other_prefix() {
        let a = Identity::from_seed(&[1u8; 32]).public_key();
        let b = Identity::from_seed(&[2u8; 32]).public_key();
        assert!(!Address::for_key(&a).matches_key(&b));

        // Differences past the embedded prefix do not matter
        let mut tail = *a.as_bytes();
        tail[31] ^= 0xff;
        assert!(Address::for_key(&a).matches_key(&PublicKey::from_bytes(tail)));
    }

    #[test]
    fn test_ipv6_conversion_and_display() {
        let ip: Ipv6Addr = "fd12:3456:789a:bcde:f012:3456:789a:bcde".parse().unwrap();
        let addr = Address::from(ip);
        assert!(addr.is_mesh());
        assert_eq!(addr.to_string(), "fd12:3456:789a:bcde:f012:3456:789a:bcde");
        assert_eq!(Ipv6Addr::from(addr), ip);

        assert!(Address::has_scope_tag(&[0xfd, 0x00]));
        assert!(!Address::has_scope_tag(&[0xfe, 0x80]));
        assert!(!Address::has_scope_tag(&[]));
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Address::from_slice(&[0xfd; 16]).is_ok());
        assert!(Address::from_slice(&[0xfd; 15]).is_err());
    }
}
