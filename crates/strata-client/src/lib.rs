//! Strata Client
//!
//! Client side of the display protocol: connect to a server, discover its
//! buffer backend, create surfaces through proxies and receive events.

pub mod display;
pub mod error;
pub mod proxy;

pub use display::{DisplayHandle, Event};
pub use error::ClientError;
pub use proxy::{Proxy, SurfaceProxy};
