use strata_shm::BackendError;
use strata_wire::{ConnectionError, DecodeError, EncodeError, FramingError, RingError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[from] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("malformed handshake: {0}")]
    Handshake(#[source] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("server does not advertise a buffer backend")]
    NoBackend,

    #[error("client object id range exhausted")]
    IdsExhausted,

    #[error("object {0} has no request with opcode {1}")]
    UnknownRequest(u32, u16),
}
