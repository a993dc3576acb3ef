//! Hardware (MAC) addresses as bound to pool slots.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A 48-bit Ethernet hardware address.
///
/// Displayed and stored as lowercase colon-separated hex
/// (`aa:bb:cc:dd:ee:ff`). Parsing also accepts `-` separators and upper case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Marks a slot that is not bound to any client.
    pub const UNBOUND: MacAddr = MacAddr([0; 6]);

    /// Bookkeeping value for slots held on behalf of no real client.
    pub const PLACEHOLDER: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_unbound(&self) -> bool {
        *self == Self::UNBOUND
    }

    pub fn is_placeholder(&self) -> bool {
        *self == Self::PLACEHOLDER
    }

    /// Returns an error if this address may not occupy a reserved slot.
    pub(crate) fn ensure_bindable(&self) -> Result<()> {
        if self.is_unbound() {
            return Err(Error::InvalidMac(format!(
                "{} denotes an unbound slot",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', ":");
        let mut octets = [0u8; 6];
        let mut parts = normalized.split(':');

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .filter(|part| part.len() == 2)
                .ok_or_else(|| Error::InvalidMac(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(Error::InvalidMac(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
