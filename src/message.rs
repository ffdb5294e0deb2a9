use std::fmt;

use enumflags2::BitFlags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Body, BodyReader};

/// The kind of a D-Bus message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    /// An invalid message, as per the specification.
    Invalid = 0,
    /// A method call, potentially expecting a reply.
    MethodCall = 1,
    /// The success reply to a method call.
    MethodReturn = 2,
    /// The error reply to a method call.
    Error = 3,
    /// A broadcast or directed signal.
    Signal = 4,
}

/// The header flags of a D-Bus message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, BitFlags)]
pub enum MessageFlags {
    /// The sender does not want a reply to this method call.
    NoReplyExpected = 0x1,
    /// Do not launch an owner for the destination name.
    NoAutoStart = 0x2,
}

/// The header of a [`Message`]: everything but the body bytes.
///
/// The engine assigns `serial` when the message is sent; every other field
/// round-trips untouched between the stream and the user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHeader {
    msg_type: Option<MessageType>,
    serial: u32,
    flags: BitFlags<MessageFlags>,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    error_name: Option<String>,
    signature: Option<String>,
}

impl MessageHeader {
    /// A header of the given kind, with all fields unset.
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type: Some(msg_type),
            ..Self::default()
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type.unwrap_or(MessageType::Invalid)
    }

    /// The sender-assigned serial, `0` until the engine assigns one.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn flags(&self) -> BitFlags<MessageFlags> {
        self.flags
    }

    /// Whether the sender of this method call wants a reply.
    pub fn reply_expected(&self) -> bool {
        !self.flags.contains(MessageFlags::NoReplyExpected)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn set_flags(&mut self, flags: BitFlags<MessageFlags>) {
        self.flags = flags;
    }

    pub fn set_reply_serial(&mut self, serial: Option<u32>) {
        self.reply_serial = serial;
    }

    pub fn set_path(&mut self, path: Option<String>) {
        self.path = path;
    }

    pub fn set_interface(&mut self, interface: Option<String>) {
        self.interface = interface;
    }

    pub fn set_member(&mut self, member: Option<String>) {
        self.member = member;
    }

    pub fn set_destination(&mut self, destination: Option<String>) {
        self.destination = destination;
    }

    pub fn set_sender(&mut self, sender: Option<String>) {
        self.sender = sender;
    }

    pub fn set_error_name(&mut self, error_name: Option<String>) {
        self.error_name = error_name;
    }

    pub fn set_signature(&mut self, signature: Option<String>) {
        self.signature = signature;
    }
}

/// A D-Bus message: a typed header and opaque body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    header: MessageHeader,
    body: Vec<u8>,
}

impl Message {
    /// Create a method call message.
    pub fn method(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        body: Body,
    ) -> Self {
        let mut header = MessageHeader::new(MessageType::MethodCall);
        header.set_destination(destination.map(String::from));
        header.set_path(Some(path.to_string()));
        header.set_interface(interface.map(String::from));
        header.set_member(Some(member.to_string()));

        Self::with_body(header, body)
    }

    /// Create a signal message.
    pub fn signal(path: &str, interface: &str, member: &str, body: Body) -> Self {
        let mut header = MessageHeader::new(MessageType::Signal);
        header.set_path(Some(path.to_string()));
        header.set_interface(Some(interface.to_string()));
        header.set_member(Some(member.to_string()));

        Self::with_body(header, body)
    }

    /// Create a success reply to `call`.
    pub fn method_reply(call: &Message, body: Body) -> Self {
        let mut header = MessageHeader::new(MessageType::MethodReturn);
        header.set_reply_serial(Some(call.header.serial()));
        header.set_destination(call.header.sender().map(String::from));

        Self::with_body(header, body)
    }

    /// Create an error reply to `call`, with `message` as its description.
    pub fn method_error(call: &Message, error_name: &str, message: &str) -> Self {
        let mut header = MessageHeader::new(MessageType::Error);
        header.set_error_name(Some(error_name.to_string()));
        header.set_reply_serial(Some(call.header.serial()));
        header.set_destination(call.header.sender().map(String::from));

        Self::with_body(header, crate::BodyWriter::new().put_str(message).finish())
    }

    /// Assemble a message from an already-built header and raw body bytes.
    ///
    /// This is the entry point for message streams decoding inbound frames.
    pub fn from_parts(header: MessageHeader, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    fn with_body(mut header: MessageHeader, body: Body) -> Self {
        let (signature, data) = body.into_parts();
        header.set_signature(signature);

        Self { header, body: data }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    /// The raw body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// A reader over the body for the bus control types.
    pub fn body_reader(&self) -> BodyReader<'_> {
        BodyReader::new(&self.body)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header.msg_type() {
            MessageType::MethodCall => {
                write!(f, "Method call {}", self.header.member().unwrap_or(""))
            }
            MessageType::MethodReturn => write!(f, "Method return"),
            MessageType::Error => write!(f, "Error {}", self.header.error_name().unwrap_or("")),
            MessageType::Signal => write!(f, "Signal {}", self.header.member().unwrap_or("")),
            MessageType::Invalid => write!(f, "Invalid"),
        }
    }
}
