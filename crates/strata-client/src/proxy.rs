//! Client-side handles to server objects

use strata_shm::Buffer;
use strata_wire::protocol::surface;
use strata_wire::{Arg, Object};

use crate::display::DisplayHandle;
use crate::error::ClientError;

/// A client's reference to a server object.
///
/// Requests are marshalled against the object's interface; the proxy
/// itself holds no connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proxy {
    object: Object,
}

impl Proxy {
    pub(crate) fn new(object: Object) -> Self {
        Self { object }
    }

    pub fn id(&self) -> u32 {
        self.object.id
    }

    pub fn interface(&self) -> &'static strata_wire::Interface {
        self.object.interface
    }

    /// Queue request `opcode` with `args` on the display's connection.
    pub fn send(&self, display: &mut DisplayHandle, opcode: u16, args: &[Arg]) -> Result<(), ClientError> {
        let request = self
            .object
            .interface
            .request(opcode)
            .ok_or(ClientError::UnknownRequest(self.object.id, opcode))?;
        display.marshal(self.object.id, opcode, request.signature, args)
    }
}

/// Proxy for a `surface` object.
#[derive(Debug, PartialEq, Eq)]
pub struct SurfaceProxy {
    proxy: Proxy,
}

impl SurfaceProxy {
    pub(crate) fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn id(&self) -> u32 {
        self.proxy.id()
    }

    pub fn proxy(&self) -> Proxy {
        self.proxy
    }

    /// Destroy the surface; its id becomes available again.
    pub fn destroy(self, display: &mut DisplayHandle) -> Result<(), ClientError> {
        self.proxy.send(display, surface::DESTROY, &[])?;
        display.release_id(self.proxy.id());
        Ok(())
    }

    pub fn attach(
        &self,
        display: &mut DisplayHandle,
        name: u32,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<(), ClientError> {
        self.proxy.send(
            display,
            surface::ATTACH,
            &[
                Arg::Uint(name),
                Arg::Uint(width),
                Arg::Uint(height),
                Arg::Uint(stride),
            ],
        )
    }

    pub fn attach_buffer(&self, display: &mut DisplayHandle, buffer: &Buffer) -> Result<(), ClientError> {
        self.attach(display, buffer.handle, buffer.width, buffer.height, buffer.stride)
    }

    pub fn map(&self, display: &mut DisplayHandle, x: i32, y: i32, width: i32, height: i32) -> Result<(), ClientError> {
        self.proxy.send(
            display,
            surface::MAP,
            &[Arg::Int(x), Arg::Int(y), Arg::Int(width), Arg::Int(height)],
        )
    }

    /// Copy a region of buffer `name` into this surface at `(dst_x, dst_y)`.
    #[allow(clippy::too_many_arguments)]
    pub fn copy(
        &self,
        display: &mut DisplayHandle,
        dst_x: i32,
        dst_y: i32,
        name: u32,
        stride: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> Result<(), ClientError> {
        self.proxy.send(
            display,
            surface::COPY,
            &[
                Arg::Int(dst_x),
                Arg::Int(dst_y),
                Arg::Uint(name),
                Arg::Uint(stride),
                Arg::Int(x),
                Arg::Int(y),
                Arg::Int(width),
                Arg::Int(height),
            ],
        )
    }

    /// Copy the whole of `buffer` into this surface at `(dst_x, dst_y)`.
    pub fn copy_buffer(
        &self,
        display: &mut DisplayHandle,
        dst_x: i32,
        dst_y: i32,
        buffer: &Buffer,
    ) -> Result<(), ClientError> {
        self.copy(
            display,
            dst_x,
            dst_y,
            buffer.handle,
            buffer.stride,
            0,
            0,
            buffer.width as i32,
            buffer.height as i32,
        )
    }

    pub fn damage(&self, display: &mut DisplayHandle, x: i32, y: i32, width: i32, height: i32) -> Result<(), ClientError> {
        self.proxy.send(
            display,
            surface::DAMAGE,
            &[Arg::Int(x), Arg::Int(y), Arg::Int(width), Arg::Int(height)],
        )
    }
}
