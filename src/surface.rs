//! Surfaces
//!
//! A surface is a client-created rectangle of pixels. The server tracks
//! where it is mapped, which buffer is attached and what has changed since
//! the last repaint; the compositor may hang its own data off it.

use std::any::Any;
use std::fmt;

use strata_shm::Buffer;

use crate::session::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// True if both far edges are representable as `i32`.
    pub fn is_valid(&self) -> bool {
        self.x.checked_add(self.width).is_some() && self.y.checked_add(self.height).is_some()
    }

    /// Exclusive right edge
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Smallest rectangle containing both, clamped to `i32` extents.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let width = self.right().max(other.right()) - x as i64;
        let height = self.bottom().max(other.bottom()) - y as i64;
        Rect::new(x, y, clamp_i32(width), clamp_i32(height))
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x.saturating_add(dx), self.y.saturating_add(dy), self.width, self.height)
    }
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

pub struct Surface {
    id: u32,
    owner: ClientId,
    geometry: Option<Rect>,
    buffer: Option<Buffer>,
    damage: Option<Rect>,
    /// Owned by the compositor
    pub compositor_data: Option<Box<dyn Any>>,
}

impl Surface {
    pub fn new(id: u32, owner: ClientId) -> Self {
        Self {
            id,
            owner,
            geometry: None,
            buffer: None,
            damage: None,
            compositor_data: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    /// Where the surface is mapped, `None` before the first map.
    pub fn geometry(&self) -> Option<Rect> {
        self.geometry
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn damage(&self) -> Option<Rect> {
        self.damage
    }

    pub fn set_geometry(&mut self, geometry: Rect) {
        self.geometry = Some(geometry);
    }

    /// Attach a buffer, returning the one it replaces.
    pub fn replace_buffer(&mut self, buffer: Buffer) -> Option<Buffer> {
        self.buffer.replace(buffer)
    }

    pub fn take_buffer(&mut self) -> Option<Buffer> {
        self.buffer.take()
    }

    /// Accumulate damage in surface-local coordinates.
    pub fn add_damage(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.damage = Some(match self.damage {
            Some(damage) => damage.union(&rect),
            None => rect,
        });
    }

    pub fn take_damage(&mut self) -> Option<Rect> {
        self.damage.take()
    }

    /// Downcast the compositor's data.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.compositor_data.as_ref()?.downcast_ref()
    }

    pub fn data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.compositor_data.as_mut()?.downcast_mut()
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("geometry", &self.geometry)
            .field("buffer", &self.buffer)
            .field("damage", &self.damage)
            .finish_non_exhaustive()
    }
}
