//! Per-client connection state

use std::fmt;
use std::os::unix::net::UnixStream;

use strata_wire::codec::{self, Arg};
use strata_wire::protocol::{display, CLIENT_ID_RANGE, DISPLAY_ID};
use strata_wire::{
    ConnectionError, EncodeError, Global, Handshake, RequestError, RingConnection, SourceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted and advertised to, no request seen yet
    Connected,
    /// Exchanging requests and events
    Active,
    /// Torn down; the session is about to be dropped
    Disconnected,
}

#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    pub(crate) conn: RingConnection,
    pub(crate) source: Option<SourceId>,
    base: u32,
    /// Objects this client created, in creation order
    pub(crate) objects: Vec<u32>,
    pub(crate) state: SessionState,
}

impl ClientSession {
    pub fn new(id: ClientId, stream: UnixStream, base: u32) -> Result<Self, ConnectionError> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            id,
            conn: RingConnection::new(stream),
            source: None,
            base,
            objects: Vec::new(),
            state: SessionState::Connected,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// First id of the client's range
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn objects(&self) -> &[u32] {
        &self.objects
    }

    /// True if `id` falls in the range this client may mint from.
    pub fn owns_id(&self, id: u32) -> bool {
        (self.base as u64..self.base as u64 + CLIENT_ID_RANGE as u64).contains(&(id as u64))
    }

    /// Write the handshake and push it to the socket.
    pub fn send_handshake(&mut self, globals: &[Global]) -> Result<(), ConnectionError> {
        let handshake = Handshake {
            base: self.base,
            globals: globals.to_vec(),
        };
        self.conn.write(&handshake.encode())?;
        self.conn.flush()
    }

    pub fn send_event(
        &mut self,
        object: u32,
        opcode: u16,
        signature: &str,
        args: &[Arg],
    ) -> Result<(), EncodeError> {
        codec::marshal(&mut self.conn, None, object, opcode, signature, args)
    }

    /// Report a failed request with the matching display event.
    pub fn send_error(&mut self, error: &RequestError) -> Result<(), EncodeError> {
        self.send_event(DISPLAY_ID, error_event(error), "", &[])
    }
}

/// Display event reporting `error`
pub fn error_event(error: &RequestError) -> u16 {
    use strata_wire::DecodeError;

    match error {
        RequestError::InvalidObject(_)
        | RequestError::Decode(DecodeError::UnknownObject(_))
        | RequestError::Decode(DecodeError::DuplicateId(_)) => display::INVALID_OBJECT,
        RequestError::InvalidMethod { .. } | RequestError::Decode(_) => display::INVALID_METHOD,
        RequestError::NoMemory => display::NO_MEMORY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_wire::DecodeError;

    #[test]
    fn test_id_range() {
        let (stream, _peer) = UnixStream::pair().unwrap();
        let session = ClientSession::new(ClientId::new(1), stream, 256).unwrap();
        assert!(session.owns_id(256));
        assert!(session.owns_id(511));
        assert!(!session.owns_id(512));
        assert!(!session.owns_id(10));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_error_events() {
        assert_eq!(error_event(&RequestError::InvalidObject(3)), display::INVALID_OBJECT);
        assert_eq!(
            error_event(&RequestError::Decode(DecodeError::DuplicateId(3))),
            display::INVALID_OBJECT
        );
        assert_eq!(
            error_event(&RequestError::Decode(DecodeError::Truncated { index: 0 })),
            display::INVALID_METHOD
        );
        assert_eq!(
            error_event(&RequestError::InvalidMethod { object: 1, opcode: 9 }),
            display::INVALID_METHOD
        );
        assert_eq!(error_event(&RequestError::NoMemory), display::NO_MEMORY);
    }
}
