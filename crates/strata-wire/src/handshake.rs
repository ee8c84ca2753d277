//! Connection handshake
//!
//! The first bytes a server writes on a new connection:
//!
//! ```text
//! u32 id-range base
//! u32 global count (the display included)
//! per global: u32 id, u32 name length, name bytes padded to 4
//! ```
//!
//! The display is always the first global.

use crate::error::DecodeError;
use crate::protocol::{interface_by_name, DISPLAY_ID};

/// A globally advertised object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub id: u32,
    pub name: String,
}

impl Global {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }

    /// True when the name is one of the core interfaces.
    pub fn is_core(&self) -> bool {
        interface_by_name(&self.name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// First object id the client may mint
    pub base: u32,
    pub globals: Vec<Global>,
}

impl Handshake {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.base.to_ne_bytes());
        out.extend_from_slice(&(self.globals.len() as u32).to_ne_bytes());
        for global in &self.globals {
            out.extend_from_slice(&global.id.to_ne_bytes());
            out.extend_from_slice(&(global.name.len() as u32).to_ne_bytes());
            out.extend_from_slice(global.name.as_bytes());
            out.resize((out.len() + 3) & !3, 0);
        }
        out
    }

    /// Parse a handshake from the front of `bytes`.
    ///
    /// Returns `Ok(None)` until the whole handshake is present, otherwise the
    /// handshake and the number of bytes it occupied.
    pub fn parse(bytes: &[u8]) -> Result<Option<(Self, usize)>, DecodeError> {
        let mut pos = 0;
        let word = |pos: &mut usize| -> Option<u32> {
            let b = bytes.get(*pos..*pos + 4)?;
            *pos += 4;
            Some(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        };

        let Some(base) = word(&mut pos) else { return Ok(None) };
        let Some(count) = word(&mut pos) else { return Ok(None) };

        let mut globals = Vec::new();
        for index in 0..count as usize {
            let Some(id) = word(&mut pos) else { return Ok(None) };
            let Some(len) = word(&mut pos) else { return Ok(None) };
            let len = len as usize;
            let end = pos + ((len + 3) & !3);
            if end > bytes.len() {
                return Ok(None);
            }
            let name = std::str::from_utf8(&bytes[pos..pos + len])
                .map_err(|_| DecodeError::InvalidUtf8 { index })?;
            globals.push(Global::new(id, name));
            pos = end;
        }

        if globals.first().map(|g| g.id) != Some(DISPLAY_ID) {
            return Err(DecodeError::UnknownObject(
                globals.first().map(|g| g.id).unwrap_or(0),
            ));
        }

        Ok(Some((Self { base, globals }, pos)))
    }
}
