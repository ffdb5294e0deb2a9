//! Types, names and message builders for the `org.freedesktop.DBus`
//! interface that every bus daemon implements.

use enumflags2::BitFlags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Body, BodyWriter, Message};

/// The bus service, interface and object path.
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";

/// The peer interface every connection answers itself.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

pub const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

pub(crate) const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
pub(crate) const NAME_ACQUIRED: &str = "NameAcquired";
pub(crate) const NAME_LOST: &str = "NameLost";

/// Flags for [`Connection::request_name`].
///
/// [`Connection::request_name`]: ../struct.Connection.html#method.request_name
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, BitFlags)]
pub enum RequestNameFlags {
    /// Allow another peer to take the name over.
    AllowReplacement = 0x01,
    /// Take the name over from its current owner, if it allows that.
    ReplaceExisting = 0x02,
    /// Do not queue for the name if it is taken.
    DoNotQueue = 0x04,
}

/// The outcome of a `RequestName` call.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum RequestNameReply {
    /// The connection now owns the name.
    PrimaryOwner = 0x01,
    /// Another peer owns the name; the connection is queued for it.
    InQueue = 0x02,
    /// Another peer owns the name and the connection did not queue.
    Exists = 0x03,
    /// The connection already owned the name.
    AlreadyOwner = 0x04,
}

/// The outcome of a `ReleaseName` call.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ReleaseNameReply {
    /// The name was released.
    Released = 0x01,
    /// No peer owned the name.
    NonExistent = 0x02,
    /// Another peer owns the name.
    NotOwner = 0x03,
}

/// The key a signal subscription matches on, and the match rule the bus is
/// told about for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalMatchRule {
    path: String,
    interface: String,
    member: String,
}

impl SignalMatchRule {
    pub fn new(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
        }
    }

    /// The standard match-rule string for this subscription.
    pub fn rule_string(&self) -> String {
        format!(
            "type='signal',interface='{}',member='{}',path='{}'",
            self.interface, self.member, self.path
        )
    }
}

/// The match rule forwarding `NameOwnerChanged` for one service name.
pub(crate) fn owner_changed_rule(service: &str) -> String {
    format!(
        "type='signal',interface='{}',member='{}',arg0='{}'",
        DBUS_INTERFACE, NAME_OWNER_CHANGED, service
    )
}

fn bus_call(member: &str, body: Body) -> Message {
    Message::method(Some(DBUS_SERVICE), DBUS_PATH, Some(DBUS_INTERFACE), member, body)
}

pub(crate) fn hello() -> Message {
    bus_call("Hello", Body::empty())
}

pub(crate) fn request_name(name: &str, flags: BitFlags<RequestNameFlags>) -> Message {
    bus_call(
        "RequestName",
        BodyWriter::new().put_str(name).put_u32(flags.bits()).finish(),
    )
}

pub(crate) fn release_name(name: &str) -> Message {
    bus_call("ReleaseName", BodyWriter::new().put_str(name).finish())
}

pub(crate) fn add_match(rule: &str) -> Message {
    bus_call("AddMatch", BodyWriter::new().put_str(rule).finish())
}

pub(crate) fn remove_match(rule: &str) -> Message {
    bus_call("RemoveMatch", BodyWriter::new().put_str(rule).finish())
}
