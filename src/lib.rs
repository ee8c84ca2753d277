//! Strata - a small display server
//!
//! Clients connect over an abstract Unix socket, create surfaces, attach
//! shared-memory buffers to them and map them on screen. The wire format
//! and event loop live in `strata-wire`, buffer storage in `strata-shm`.

mod advertisement;
pub mod compositor;
pub mod config;
pub mod display;
pub mod session;
pub mod surface;

pub use compositor::{Compositor, CopyRegion, HeadlessCompositor};
pub use config::Config;
pub use display::{Display, DisplayError, DisplayState};
pub use session::{ClientId, ClientSession, SessionState};
pub use surface::{Rect, Surface};
