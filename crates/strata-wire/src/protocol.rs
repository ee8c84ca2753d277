//! Core protocol: the display, surface and backend advertisement interfaces
//!
//! Type tags: `u` uint32, `i` int32, `s` string, `o` object reference,
//! `n` new object id.

use crate::interface::{Interface, MessageDesc};

/// Object id of the display, advertised first to every client
pub const DISPLAY_ID: u32 = 1;

/// Object id of the backend advertisement global
pub const BACKEND_ADVERTISEMENT_ID: u32 = 2;

/// Number of object ids handed to each client at connect time
pub const CLIENT_ID_RANGE: u32 = 256;

pub mod display {
    // Requests
    pub const CREATE_SURFACE: u16 = 0;

    // Events
    pub const INVALID_OBJECT: u16 = 0;
    pub const INVALID_METHOD: u16 = 1;
    pub const NO_MEMORY: u16 = 2;
}

pub mod surface {
    pub const DESTROY: u16 = 0;
    pub const ATTACH: u16 = 1;
    pub const MAP: u16 = 2;
    pub const COPY: u16 = 3;
    pub const DAMAGE: u16 = 4;
}

pub mod backend_advertisement {
    pub const REQUEST_INFO: u16 = 0;
    pub const REPLY_INFO: u16 = 0;
}

pub static DISPLAY_INTERFACE: Interface = Interface {
    name: "display",
    version: 1,
    requests: &[MessageDesc::new("create_surface", "n")],
    events: &[
        MessageDesc::new("invalid_object", ""),
        MessageDesc::new("invalid_method", ""),
        MessageDesc::new("no_memory", ""),
    ],
};

pub static SURFACE_INTERFACE: Interface = Interface {
    name: "surface",
    version: 1,
    requests: &[
        MessageDesc::new("destroy", ""),
        // name, width, height, stride
        MessageDesc::new("attach", "uuuu"),
        // x, y, width, height
        MessageDesc::new("map", "iiii"),
        // dst_x, dst_y, name, stride, x, y, width, height
        MessageDesc::new("copy", "iiuuiiii"),
        MessageDesc::new("damage", "iiii"),
    ],
    events: &[],
};

pub static BACKEND_ADVERTISEMENT_INTERFACE: Interface = Interface {
    name: "backend_advertisement",
    version: 1,
    requests: &[MessageDesc::new("request_info", "")],
    // backend name, backend args
    events: &[MessageDesc::new("reply_info", "ss")],
};

/// Look up a core interface by its advertised name.
pub fn interface_by_name(name: &str) -> Option<&'static Interface> {
    [
        &DISPLAY_INTERFACE,
        &SURFACE_INTERFACE,
        &BACKEND_ADVERTISEMENT_INTERFACE,
    ]
    .into_iter()
    .find(|interface| interface.name == name)
}
