use crate::{Error, Guid, Result};

/// One candidate entry of a D-Bus server address.
///
/// A server address is a `;`-separated list of entries of the form
/// `transport:key=value,key=value`. Entries are tried in the order they
/// appear until a transport opens. The optional `guid` key names the GUID
/// the server is expected to present.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressEntry {
    transport: String,
    options: Vec<(String, String)>,
    guid: Option<Guid>,
}

impl AddressEntry {
    /// The transport kind, e.g. `unix` or `tcp`.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// The transport parameters, in the order they appeared.
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Look up a single transport parameter.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The GUID the server is expected to present, if the entry carries one.
    pub fn guid(&self) -> Option<&Guid> {
        self.guid.as_ref()
    }
}

/// Parse a D-Bus server address into its candidate entries.
///
/// Fails if the address contains no entries or an entry is malformed.
pub fn parse_address(address: &str) -> Result<Vec<AddressEntry>> {
    let mut entries = vec![];

    for entry in address.split(';').filter(|e| !e.is_empty()) {
        entries.push(parse_entry(entry)?);
    }

    if entries.is_empty() {
        return Err(Error::Address(format!("no addresses found in '{}'", address)));
    }

    Ok(entries)
}

fn parse_entry(entry: &str) -> Result<AddressEntry> {
    let colon = entry
        .find(':')
        .ok_or_else(|| Error::Address(format!("'{}' is missing a transport", entry)))?;
    let (transport, rest) = entry.split_at(colon);
    if transport.is_empty() {
        return Err(Error::Address(format!("'{}' is missing a transport", entry)));
    }

    let mut options = vec![];
    let mut guid = None;
    for pair in rest[1..].split(',').filter(|p| !p.is_empty()) {
        let eq = pair
            .find('=')
            .ok_or_else(|| Error::Address(format!("'{}' is not a key=value pair", pair)))?;
        let key = &pair[..eq];
        let value = unescape(&pair[eq + 1..])?;
        if key == "guid" {
            guid = Some(Guid::from_string(&value)?);
        } else {
            options.push((key.to_string(), value));
        }
    }

    Ok(AddressEntry {
        transport: transport.to_string(),
        options,
        guid,
    })
}

// Optionally-escaped bytes use the URI-style %XX form.
fn unescape(value: &str) -> Result<String> {
    if !value.contains('%') {
        return Ok(value.to_string());
    }

    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();
    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let hi = bytes.next();
        let lo = bytes.next();
        match (hi.and_then(hex), lo.and_then(hex)) {
            (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
            _ => {
                return Err(Error::Address(format!(
                    "invalid %-escape in value '{}'",
                    value
                )))
            }
        }
    }

    String::from_utf8(out).map_err(|e| Error::Address(e.to_string()))
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
