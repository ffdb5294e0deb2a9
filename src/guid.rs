use std::fmt;
use std::fs;

use once_cell::sync::OnceCell;

use crate::{Error, Result};

/// A D-Bus server GUID: 32 lowercase hexadecimal characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Guid(String);

impl Guid {
    /// Generate a new random GUID.
    pub fn generate() -> Self {
        let mut s = String::with_capacity(32);
        for _ in 0..32 {
            s.push(std::char::from_digit(fastrand::u32(..16), 16).unwrap());
        }

        Self(s)
    }

    /// Create a GUID from a string, validating its format.
    pub fn from_string(guid: &str) -> Result<Self> {
        if guid.len() != 32 || !guid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Address(format!("invalid GUID '{}'", guid)));
        }

        Ok(Self(guid.to_ascii_lowercase()))
    }

    /// The GUID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The stable per-machine UUID string, as reported by
/// `org.freedesktop.DBus.Peer.GetMachineId`.
///
/// Read from `/etc/machine-id`, falling back to the D-Bus location
/// `/var/lib/dbus/machine-id`. Hosts providing neither get a process-wide
/// random ID so the Peer responder stays functional.
pub fn machine_id() -> &'static str {
    static MACHINE_ID: OnceCell<String> = OnceCell::new();

    MACHINE_ID.get_or_init(|| {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .map(|id| id.trim().to_string())
            .find(|id| !id.is_empty())
            .unwrap_or_else(|| Guid::generate().as_str().to_string())
    })
}
