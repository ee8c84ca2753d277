//! Compositor collaborator
//!
//! The display notifies its compositor about every surface change and asks
//! it to repaint once per batch of client requests. [`HeadlessCompositor`]
//! composites into an in-memory canvas.

use strata_shm::{Backend, BackendError, Buffer};
use strata_wire::RequestError;
use tracing::{debug, trace};

use crate::surface::{Rect, Surface};

/// Bytes per pixel of the canvas and of client buffers
pub const BYTES_PER_PIXEL: usize = 4;

/// Arguments of a `surface.copy` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub dst_x: i32,
    pub dst_y: i32,
    /// Source buffer handle
    pub name: u32,
    pub stride: u32,
    pub src: Rect,
}

impl CopyRegion {
    /// Destination rectangle in surface-local coordinates.
    pub fn dst(&self) -> Rect {
        Rect::new(self.dst_x, self.dst_y, self.src.width, self.src.height)
    }
}

pub trait Compositor {
    /// A surface was created. Failing leaves no trace of it.
    fn surface_created(&mut self, _surface: &mut Surface) -> Result<(), RequestError> {
        Ok(())
    }

    fn surface_destroyed(&mut self, _surface: &mut Surface) {}

    /// A new buffer is attached; the previous one is already released.
    fn surface_attached(&mut self, _surface: &mut Surface, _backend: &mut dyn Backend) -> Result<(), BackendError> {
        Ok(())
    }

    fn surface_mapped(&mut self, _surface: &mut Surface) {}

    fn surface_copied(
        &mut self,
        _surface: &mut Surface,
        _backend: &mut dyn Backend,
        _copy: &CopyRegion,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn surface_damaged(&mut self, _surface: &mut Surface, _rect: Rect) {}

    /// Draw every mapped surface, in order.
    fn repaint(&mut self, surfaces: &[Surface], backend: &dyn Backend);
}

/// Surface contents as last uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceImage {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixels: Vec<u8>,
}

impl SurfaceImage {
    fn load(backend: &dyn Backend, buffer: &Buffer) -> Result<Self, BackendError> {
        let mut pixels = vec![0; buffer.size()];
        backend.read(buffer, &mut pixels)?;
        Ok(Self {
            width: buffer.width,
            height: buffer.height,
            stride: buffer.stride,
            pixels,
        })
    }

    fn row(&self, y: u32, x: u32, width: u32) -> Option<&[u8]> {
        let start = y as usize * self.stride as usize + x as usize * BYTES_PER_PIXEL;
        self.pixels.get(start..start + width as usize * BYTES_PER_PIXEL)
    }
}

/// Compositor that renders into memory instead of a display device.
#[derive(Debug)]
pub struct HeadlessCompositor {
    width: u32,
    height: u32,
    canvas: Vec<u8>,
    frames: u64,
}

impl HeadlessCompositor {
    pub fn new(width: u32, height: u32) -> Self {
        debug!("headless compositor {}x{}", width, height);
        Self {
            width,
            height,
            canvas: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            frames: 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Number of repaints so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn canvas(&self) -> &[u8] {
        &self.canvas
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let px = self.canvas.get(start..start + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    fn blit(&mut self, image: &SurfaceImage, at: Rect) {
        // Clip to the image, the mapped rectangle and the canvas, in i64 so
        // far-off geometry cannot overflow.
        let (ax, ay) = (at.x as i64, at.y as i64);
        let x0 = ax.max(0);
        let y0 = ay.max(0);
        let x1 = (ax + (at.width as i64).min(image.width as i64)).min(self.width as i64);
        let y1 = (ay + (at.height as i64).min(image.height as i64)).min(self.height as i64);
        if x1 <= x0 || y1 <= y0 {
            return;
        }

        let span = (x1 - x0) as u32;
        for y in y0..y1 {
            let Some(src) = image.row((y - ay) as u32, (x0 - ax) as u32, span) else {
                continue;
            };
            let start = (y as usize * self.width as usize + x0 as usize) * BYTES_PER_PIXEL;
            self.canvas[start..start + src.len()].copy_from_slice(src);
        }
    }
}

impl Compositor for HeadlessCompositor {
    fn surface_destroyed(&mut self, surface: &mut Surface) {
        surface.compositor_data = None;
    }

    fn surface_attached(&mut self, surface: &mut Surface, backend: &mut dyn Backend) -> Result<(), BackendError> {
        let Some(buffer) = surface.buffer().copied() else {
            return Ok(());
        };
        let image = SurfaceImage::load(backend, &buffer)?;
        trace!("uploaded {}x{} image for surface {}", image.width, image.height, surface.id());
        surface.compositor_data = Some(Box::new(image));
        Ok(())
    }

    fn surface_copied(
        &mut self,
        surface: &mut Surface,
        backend: &mut dyn Backend,
        copy: &CopyRegion,
    ) -> Result<(), BackendError> {
        let Some(image) = surface.data_mut::<SurfaceImage>() else {
            return Ok(());
        };
        if copy.src.is_empty() || copy.src.x < 0 || copy.src.y < 0 || !copy.src.is_valid() {
            return Ok(());
        }

        let source = backend.open(copy.name, copy.src.right() as u32, copy.src.bottom() as u32, copy.stride)?;
        let loaded = SurfaceImage::load(backend, &source);
        backend.destroy(source)?;
        let source = loaded?;

        let dst_x = copy.dst_x as i64;
        let x0 = dst_x.max(0);
        let x1 = (dst_x + copy.src.width as i64).min(image.width as i64);
        if x1 <= x0 {
            return Ok(());
        }
        let span = (x1 - x0) as u32;
        let src_x = (copy.src.x as i64 + x0 - dst_x) as u32;

        for row in 0..copy.src.height as i64 {
            let dst_y = copy.dst_y as i64 + row;
            if dst_y < 0 || dst_y >= image.height as i64 {
                continue;
            }
            let Some(src) = source.row((copy.src.y as i64 + row) as u32, src_x, span) else {
                continue;
            };
            let start = dst_y as usize * image.stride as usize + x0 as usize * BYTES_PER_PIXEL;
            if let Some(dst) = image.pixels.get_mut(start..start + src.len()) {
                dst.copy_from_slice(src);
            }
        }
        Ok(())
    }

    fn repaint(&mut self, surfaces: &[Surface], _backend: &dyn Backend) {
        for surface in surfaces {
            let (Some(geometry), Some(image)) = (surface.geometry(), surface.data::<SurfaceImage>()) else {
                continue;
            };
            self.blit(image, geometry);
        }
        self.frames += 1;
        trace!("repainted frame {}", self.frames);
    }
}
