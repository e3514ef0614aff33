//! The subset of BER needed to speak LDAPv3.

pub const INTEGER: u8 = 0x02;
pub const OCTET_STRING: u8 = 0x04;
pub const BOOLEAN: u8 = 0x01;
pub const ENUMERATED: u8 = 0x0a;
pub const SEQUENCE: u8 = 0x30;
pub const SET: u8 = 0x31;

/// Context-specific constructed tag `[n]`.
pub const fn context_constructed(n: u8) -> u8 {
    0xa0 | n
}

/// Context-specific primitive tag `[n]`.
pub const fn context_primitive(n: u8) -> u8 {
    0x80 | n
}

/// Application constructed tag `[APPLICATION n]`.
pub const fn application_constructed(n: u8) -> u8 {
    0x60 | n
}

/// Application primitive tag `[APPLICATION n]`.
pub const fn application_primitive(n: u8) -> u8 {
    0x40 | n
}

pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

pub fn integer_with_tag(tag: u8, value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    tlv(tag, &bytes[start..])
}

pub fn integer(value: i64) -> Vec<u8> {
    integer_with_tag(INTEGER, value)
}

pub fn enumerated(value: i64) -> Vec<u8> {
    integer_with_tag(ENUMERATED, value)
}

pub fn octet_string(value: &[u8]) -> Vec<u8> {
    tlv(OCTET_STRING, value)
}

pub fn boolean(value: bool) -> Vec<u8> {
    tlv(BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

pub fn constructed(tag: u8, parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(tag, &parts.concat())
}

/// One decoded tag-length-value element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element<'a> {
    pub tag: u8,
    pub content: &'a [u8],
}

impl<'a> Element<'a> {
    pub fn children(&self) -> Result<Vec<Element<'a>>, String> {
        let mut reader = Reader::new(self.content);
        let mut children = Vec::new();
        while !reader.is_empty() {
            children.push(reader.next()?);
        }
        Ok(children)
    }

    pub fn as_integer(&self) -> Result<i64, String> {
        if self.content.is_empty() || self.content.len() > 8 {
            return Err(format!("invalid integer of {} bytes", self.content.len()));
        }
        let negative = self.content[0] & 0x80 != 0;
        let mut value: i64 = if negative { -1 } else { 0 };
        for byte in self.content {
            value = (value << 8) | i64::from(*byte);
        }
        Ok(value)
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(self.content).into_owned()
    }
}

/// Sequential decoder over a byte slice.
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn next(&mut self) -> Result<Element<'a>, String> {
        let (tag, header_len, content_len) = parse_header(self.data)?
            .ok_or_else(|| "truncated element".to_string())?;
        let end = header_len
            .checked_add(content_len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| "truncated element".to_string())?;
        let element = Element {
            tag,
            content: &self.data[header_len..end],
        };
        self.data = &self.data[end..];
        Ok(element)
    }
}

/// Parses the tag and length of the element at the start of `data`.
///
/// Returns `None` when more bytes are needed to know the header.
pub fn parse_header(data: &[u8]) -> Result<Option<(u8, usize, usize)>, String> {
    if data.len() < 2 {
        return Ok(None);
    }
    let tag = data[0];
    let first = data[1];
    if first & 0x80 == 0 {
        return Ok(Some((tag, 2, usize::from(first))));
    }

    let count = usize::from(first & 0x7f);
    if count == 0 || count > std::mem::size_of::<usize>() {
        return Err(format!("unsupported length encoding 0x{first:02x}"));
    }
    if data.len() < 2 + count {
        return Ok(None);
    }
    let len = data[2..2 + count]
        .iter()
        .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
    Ok(Some((tag, 2 + count, len)))
}
