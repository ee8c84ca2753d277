//! Wire codec
//!
//! Message layout:
//!
//! ```text
//! +-----------+----------------------------+----------------------+
//! | object id | size << 16 | opcode        | arguments ...        |
//! |  u32      |  u32                       |  4-byte aligned      |
//! +-----------+----------------------------+----------------------+
//! ```
//!
//! `size` counts the whole message including the 8-byte header. Integers are
//! 32-bit native-endian. Strings are a u32 byte length followed by the bytes,
//! zero-padded to a 4-byte boundary.

use tracing::trace;

use crate::error::{DecodeError, EncodeError, FramingError};
use crate::registry::ObjectRegistry;
use crate::ring::RingConnection;

/// Size of a message header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest message either side will build or buffer for decoding
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Most arguments a single message may carry
pub const MAX_ARGS: usize = 20;

/// Argument type, one per type-tag character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Uint,
    Int,
    Str,
    Object,
    NewId,
}

impl ArgKind {
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'u' => Some(Self::Uint),
            'i' => Some(Self::Int),
            's' => Some(Self::Str),
            'o' => Some(Self::Object),
            'n' => Some(Self::NewId),
            _ => None,
        }
    }

    pub fn tag(self) -> char {
        match self {
            Self::Uint => 'u',
            Self::Int => 'i',
            Self::Str => 's',
            Self::Object => 'o',
            Self::NewId => 'n',
        }
    }
}

/// A decoded (or to-be-encoded) argument value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Uint(u32),
    Int(i32),
    Str(String),
    Object(u32),
    NewId(u32),
}

impl Arg {
    pub fn kind(&self) -> ArgKind {
        match self {
            Arg::Uint(_) => ArgKind::Uint,
            Arg::Int(_) => ArgKind::Int,
            Arg::Str(_) => ArgKind::Str,
            Arg::Object(_) => ArgKind::Object,
            Arg::NewId(_) => ArgKind::NewId,
        }
    }

    pub fn tag(&self) -> char {
        self.kind().tag()
    }

    /// Bytes this argument occupies on the wire
    fn wire_len(&self) -> usize {
        match self {
            Arg::Str(s) => 4 + padded(s.len()),
            _ => 4,
        }
    }
}

/// Parse a type-tag string into argument kinds.
pub fn parse_signature(signature: &str) -> Result<Vec<ArgKind>, char> {
    signature
        .chars()
        .map(|tag| ArgKind::from_tag(tag).ok_or(tag))
        .collect()
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub object: u32,
    pub opcode: u16,
    pub size: u16,
}

impl MessageHeader {
    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        let object = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let word = u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            object,
            opcode: (word & 0xffff) as u16,
            size: (word >> 16) as u16,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let word = ((self.size as u32) << 16) | self.opcode as u32;
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.object.to_ne_bytes());
        bytes[4..].copy_from_slice(&word.to_ne_bytes());
        bytes
    }

    /// Check the declared size can be framed by a receiver.
    pub fn validate(&self) -> Result<(), FramingError> {
        let size = self.size as usize;
        if size < HEADER_SIZE {
            return Err(FramingError::TooSmall(self.size));
        }
        if size % 4 != 0 {
            return Err(FramingError::Misaligned(self.size));
        }
        if size > MAX_MESSAGE_SIZE {
            return Err(FramingError::TooLarge {
                size: self.size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}

/// Serialize one message.
pub fn encode(
    object: u32,
    opcode: u16,
    signature: &str,
    args: &[Arg],
) -> Result<Vec<u8>, EncodeError> {
    let kinds = parse_signature(signature).map_err(EncodeError::UnknownTag)?;
    if kinds.len() > MAX_ARGS {
        return Err(EncodeError::TooManyArgs(kinds.len()));
    }
    if kinds.len() != args.len() {
        return Err(EncodeError::ArgumentCount {
            expected: kinds.len(),
            found: args.len(),
        });
    }

    let size = HEADER_SIZE + args.iter().map(Arg::wire_len).sum::<usize>();
    if size > MAX_MESSAGE_SIZE {
        return Err(EncodeError::TooLarge(size));
    }

    let header = MessageHeader {
        object,
        opcode,
        size: size as u16,
    };
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&header.to_bytes());

    for (index, (kind, arg)) in kinds.iter().zip(args).enumerate() {
        if arg.kind() != *kind {
            return Err(EncodeError::SignatureMismatch {
                index,
                expected: kind.tag(),
                found: arg.tag(),
            });
        }
        match arg {
            Arg::Uint(v) | Arg::Object(v) | Arg::NewId(v) => {
                out.extend_from_slice(&v.to_ne_bytes())
            }
            Arg::Int(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Arg::Str(s) => {
                out.extend_from_slice(&(s.len() as u32).to_ne_bytes());
                out.extend_from_slice(s.as_bytes());
                out.resize(out.len() + padded(s.len()) - s.len(), 0);
            }
        }
    }

    debug_assert_eq!(out.len(), size);
    Ok(out)
}

/// Serialize one message onto a connection's outbound ring.
///
/// With a registry, object references must name live objects and new ids
/// must not.
pub fn marshal(
    conn: &mut RingConnection,
    registry: Option<&ObjectRegistry>,
    object: u32,
    opcode: u16,
    signature: &str,
    args: &[Arg],
) -> Result<(), EncodeError> {
    if let Some(registry) = registry {
        for arg in args {
            match arg {
                Arg::Object(id) if !registry.contains(*id) => {
                    return Err(EncodeError::UnknownObject(*id))
                }
                Arg::NewId(id) if registry.contains(*id) => {
                    return Err(EncodeError::DuplicateId(*id))
                }
                _ => {}
            }
        }
    }

    let bytes = encode(object, opcode, signature, args)?;
    trace!("marshal object {} opcode {} ({} bytes)", object, opcode, bytes.len());
    conn.write(&bytes)?;
    Ok(())
}

/// Read the next message header if a whole header is buffered.
///
/// The header is validated but not consumed.
pub fn peek_header(conn: &RingConnection) -> Result<Option<MessageHeader>, FramingError> {
    if conn.available() < HEADER_SIZE {
        return Ok(None);
    }
    let mut bytes = [0u8; HEADER_SIZE];
    // available() was checked above, so the peek cannot underflow
    if conn.copy(&mut bytes).is_err() {
        return Ok(None);
    }
    let header = MessageHeader::from_bytes(bytes);
    header.validate()?;
    Ok(Some(header))
}

/// Pull one full message off the inbound ring and decode its arguments.
///
/// Exactly `header.size` bytes are consumed whether or not decoding
/// succeeds, so a bad message never desynchronises the stream.
pub fn demarshal(
    conn: &mut RingConnection,
    header: &MessageHeader,
    signature: &str,
    registry: Option<&ObjectRegistry>,
) -> Result<Vec<Arg>, DecodeError> {
    let size = header.size as usize;
    let mut scratch = [0u8; MAX_MESSAGE_SIZE];
    let message = &mut scratch[..size.min(MAX_MESSAGE_SIZE)];
    conn.copy(message)?;
    conn.consume(size)?;
    decode_args(&message[HEADER_SIZE.min(message.len())..], signature, registry)
}

/// Decode a payload (everything after the header) against a signature.
pub fn decode_args(
    payload: &[u8],
    signature: &str,
    registry: Option<&ObjectRegistry>,
) -> Result<Vec<Arg>, DecodeError> {
    let kinds = parse_signature(signature).map_err(DecodeError::UnknownTag)?;
    if kinds.len() > MAX_ARGS {
        return Err(DecodeError::TooManyArgs(kinds.len()));
    }

    let mut reader = WordReader { buf: payload, pos: 0 };
    let mut args = Vec::with_capacity(kinds.len());

    for (index, kind) in kinds.into_iter().enumerate() {
        let word = reader.word().ok_or(DecodeError::Truncated { index })?;
        let arg = match kind {
            ArgKind::Uint => Arg::Uint(word),
            ArgKind::Int => Arg::Int(word as i32),
            ArgKind::Str => {
                let bytes = reader
                    .bytes(word as usize)
                    .ok_or(DecodeError::Truncated { index })?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::InvalidUtf8 { index })?;
                Arg::Str(s.to_owned())
            }
            ArgKind::Object => {
                if let Some(registry) = registry {
                    if !registry.contains(word) {
                        return Err(DecodeError::UnknownObject(word));
                    }
                }
                Arg::Object(word)
            }
            ArgKind::NewId => {
                if let Some(registry) = registry {
                    if registry.contains(word) {
                        return Err(DecodeError::DuplicateId(word));
                    }
                }
                Arg::NewId(word)
            }
        };
        args.push(arg);
    }

    let trailing = payload.len() - reader.pos;
    if trailing != 0 {
        return Err(DecodeError::TrailingBytes(trailing));
    }
    Ok(args)
}

struct WordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WordReader<'a> {
    fn word(&mut self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// `len` bytes followed by padding to the next word
    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(padded(len))?;
        if end > self.buf.len() {
            return None;
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos = end;
        Some(bytes)
    }
}

/// Typed, in-order access to decoded arguments, as seen by request handlers.
#[derive(Debug)]
pub struct ArgCursor<'a> {
    args: &'a [Arg],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(args: &'a [Arg]) -> Self {
        Self { args, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.args.len() - self.pos
    }

    fn next(&mut self, expected: ArgKind) -> Result<&'a Arg, DecodeError> {
        let index = self.pos;
        let arg = self
            .args
            .get(index)
            .ok_or(DecodeError::MissingArgument { index })?;
        if arg.kind() != expected {
            return Err(DecodeError::ArgumentType {
                index,
                expected: expected.tag(),
                found: arg.tag(),
            });
        }
        self.pos += 1;
        Ok(arg)
    }

    pub fn uint(&mut self) -> Result<u32, DecodeError> {
        match self.next(ArgKind::Uint)? {
            Arg::Uint(v) => Ok(*v),
            _ => unreachable!("kind checked in next()"),
        }
    }

    pub fn int(&mut self) -> Result<i32, DecodeError> {
        match self.next(ArgKind::Int)? {
            Arg::Int(v) => Ok(*v),
            _ => unreachable!("kind checked in next()"),
        }
    }

    pub fn string(&mut self) -> Result<&'a str, DecodeError> {
        match self.next(ArgKind::Str)? {
            Arg::Str(s) => Ok(s.as_str()),
            _ => unreachable!("kind checked in next()"),
        }
    }

    pub fn object(&mut self) -> Result<u32, DecodeError> {
        match self.next(ArgKind::Object)? {
            Arg::Object(id) => Ok(*id),
            _ => unreachable!("kind checked in next()"),
        }
    }

    pub fn new_id(&mut self) -> Result<u32, DecodeError> {
        match self.next(ArgKind::NewId)? {
            Arg::NewId(id) => Ok(*id),
            _ => unreachable!("kind checked in next()"),
        }
    }
}
