/// Minimal BER codec for LDAPv3 messages
///
/// Definite lengths only (short and long form) and single-byte tags. Frames
/// larger than [`MAX_FRAME_LEN`] are rejected before their body is read.
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single LDAP message
pub const MAX_FRAME_LEN: usize = 64 * 1024;

// Universal tags
pub const BOOLEAN: u8 = 0x01;
pub const INTEGER: u8 = 0x02;
pub const OCTET_STRING: u8 = 0x04;
pub const ENUMERATED: u8 = 0x0a;
pub const SEQUENCE: u8 = 0x30;
pub const SET: u8 = 0x31;

#[derive(Debug, Error)]
pub enum BerError {
    #[error("unexpected end of data")]
    Truncated,

    #[error("indefinite length encoding is not supported")]
    IndefiniteLength,

    #[error("length field too wide")]
    LengthOverflow,

    #[error("frame of {0} bytes exceeds the 64 KiB limit")]
    FrameTooLarge(usize),

    #[error("multi-byte tag 0x{0:02x} is not supported")]
    UnsupportedTag(u8),

    #[error("expected tag 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One tag-length-value element borrowed from a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

/// Sequential reader over the contents of a constructed element
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_tlv(&mut self) -> Result<Tlv<'a>, BerError> {
        let tag = self.take_byte()?;
        if tag & 0x1f == 0x1f {
            return Err(BerError::UnsupportedTag(tag));
        }

        let len = self.read_length()?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(BerError::Truncated)?;

        let value = &self.buf[self.pos..end];
        self.pos = end;
        Ok(Tlv { tag, value })
    }

    /// Read the next element and require its tag
    pub fn expect(&mut self, tag: u8) -> Result<&'a [u8], BerError> {
        let tlv = self.read_tlv()?;
        if tlv.tag != tag {
            return Err(BerError::UnexpectedTag {
                expected: tag,
                found: tlv.tag,
            });
        }
        Ok(tlv.value)
    }

    pub fn read_integer(&mut self, tag: u8) -> Result<i64, BerError> {
        decode_integer(self.expect(tag)?)
    }

    pub fn read_string(&mut self, tag: u8) -> Result<String, BerError> {
        Ok(String::from_utf8_lossy(self.expect(tag)?).into_owned())
    }

    pub fn read_bool(&mut self, tag: u8) -> Result<bool, BerError> {
        match self.expect(tag)? {
            [b] => Ok(*b != 0),
            _ => Err(BerError::Malformed("boolean")),
        }
    }

    fn take_byte(&mut self) -> Result<u8, BerError> {
        let b = *self.buf.get(self.pos).ok_or(BerError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_length(&mut self) -> Result<usize, BerError> {
        let first = self.take_byte()?;
        match long_form_width(first)? {
            0 => Ok(first as usize),
            width => {
                let mut len = 0usize;
                for _ in 0..width {
                    len = (len << 8) | self.take_byte()? as usize;
                }
                Ok(len)
            }
        }
    }
}

/// Number of length bytes following `first`; 0 for the short form
fn long_form_width(first: u8) -> Result<usize, BerError> {
    if first < 0x80 {
        return Ok(0);
    }
    if first == 0x80 {
        return Err(BerError::IndefiniteLength);
    }
    let width = (first & 0x7f) as usize;
    if width > 4 {
        return Err(BerError::LengthOverflow);
    }
    Ok(width)
}

pub fn write_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    buf.push(0x80 | (bytes.len() - skip) as u8);
    buf.extend_from_slice(&bytes[skip..]);
}

pub fn write_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    write_length(buf, value.len());
    buf.extend_from_slice(value);
}

pub fn write_integer(buf: &mut Vec<u8>, tag: u8, value: i64) {
    write_tlv(buf, tag, &encode_integer(value));
}

pub fn write_octets(buf: &mut Vec<u8>, value: &[u8]) {
    write_tlv(buf, OCTET_STRING, value);
}

/// Wrap already-encoded contents in a constructed element
pub fn wrap(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(contents.len() + 6);
    write_tlv(&mut buf, tag, contents);
    buf
}

/// Minimal two's complement big-endian encoding
pub fn encode_integer(value: i64) -> Vec<u8> {
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
    bytes[start..].to_vec()
}

pub fn decode_integer(bytes: &[u8]) -> Result<i64, BerError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(BerError::Malformed("integer"));
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for b in bytes {
        value = (value << 8) | *b as i64;
    }
    Ok(value)
}

/// Read one complete LDAPMessage frame, header included.
///
/// Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, BerError> {
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if tag != SEQUENCE {
        return Err(BerError::UnexpectedTag {
            expected: SEQUENCE,
            found: tag,
        });
    }

    let first = reader.read_u8().await.map_err(eof_as_truncated)?;
    let mut frame = vec![tag, first];

    let len = match long_form_width(first)? {
        0 => first as usize,
        width => {
            let mut bytes = [0u8; 4];
            reader
                .read_exact(&mut bytes[..width])
                .await
                .map_err(eof_as_truncated)?;
            frame.extend_from_slice(&bytes[..width]);
            bytes[..width]
                .iter()
                .fold(0usize, |len, b| (len << 8) | *b as usize)
        }
    };

    if len > MAX_FRAME_LEN {
        return Err(BerError::FrameTooLarge(len));
    }

    let header = frame.len();
    frame.resize(header + len, 0);
    reader
        .read_exact(&mut frame[header..])
        .await
        .map_err(eof_as_truncated)?;

    Ok(Some(frame))
}

fn eof_as_truncated(e: std::io::Error) -> BerError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BerError::Truncated
    } else {
        BerError::Io(e)
    }
}
