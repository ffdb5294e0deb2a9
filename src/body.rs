//! Minimal message-body marshalling for the bus control types.
//!
//! The engine treats message bodies as opaque bytes; full wire marshalling
//! belongs to the message stream. The `org.freedesktop.DBus` calls the
//! engine must issue itself only ever carry strings (`s`) and unsigned
//! 32-bit integers (`u`), so this module implements exactly those, with
//! the alignment rules of the D-Bus marshalling format, little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, Result};

/// An assembled message body: its signature and the marshalled bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    signature: Option<String>,
    data: Vec<u8>,
}

impl Body {
    /// An empty body with no signature.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The body signature, e.g. `su`, if the body is non-empty.
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub(crate) fn into_parts(self) -> (Option<String>, Vec<u8>) {
        (self.signature, self.data)
    }
}

/// Incrementally marshals a body, tracking its signature.
#[derive(Debug, Default)]
pub struct BodyWriter {
    signature: String,
    data: Vec<u8>,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string (`s`).
    pub fn put_str(mut self, s: &str) -> Self {
        self.align(4);
        let mut len = [0; 4];
        LittleEndian::write_u32(&mut len, s.len() as u32);
        self.data.extend_from_slice(&len);
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(b'\0');
        self.signature.push('s');

        self
    }

    /// Append an unsigned 32-bit integer (`u`).
    pub fn put_u32(mut self, value: u32) -> Self {
        self.align(4);
        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.data.extend_from_slice(&buf);
        self.signature.push('u');

        self
    }

    pub fn finish(self) -> Body {
        if self.data.is_empty() {
            Body::empty()
        } else {
            Body {
                signature: Some(self.signature),
                data: self.data,
            }
        }
    }

    fn align(&mut self, boundary: usize) {
        while self.data.len() % boundary != 0 {
            self.data.push(0);
        }
    }
}

/// Reads the bus control types back out of a body.
#[derive(Debug)]
pub struct BodyReader<'b> {
    data: &'b [u8],
    pos: usize,
}

impl<'b> BodyReader<'b> {
    pub fn new(data: &'b [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read a string (`s`).
    pub fn get_str(&mut self) -> Result<&'b str> {
        self.align(4)?;
        let len = self.fixed(4).map(LittleEndian::read_u32)? as usize;
        // `len` bytes of content plus the NUL terminator
        let bytes = self.fixed(len + 1)?;
        std::str::from_utf8(&bytes[..len])
            .map_err(|e| Error::Protocol(format!("invalid string in message body: {}", e)))
    }

    /// Read an unsigned 32-bit integer (`u`).
    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        self.fixed(4).map(LittleEndian::read_u32)
    }

    fn fixed(&mut self, len: usize) -> Result<&'b [u8]> {
        if self.data.len() - self.pos < len {
            return Err(Error::Protocol("message body too short".to_string()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;

        Ok(bytes)
    }

    fn align(&mut self, boundary: usize) -> Result<()> {
        while self.pos % boundary != 0 {
            match self.data.get(self.pos) {
                Some(0) => self.pos += 1,
                Some(_) => {
                    return Err(Error::Protocol("non-zero padding in message body".to_string()))
                }
                None => return Err(Error::Protocol("message body too short".to_string())),
            }
        }

        Ok(())
    }
}
