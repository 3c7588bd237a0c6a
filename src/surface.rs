// Per surface renderer state and buffer attachment
//
// Austin Shafer - 2020
use crate::buffer::{
    BufferKind, BufferRegistry, BufferState, ClientBuffer, ExternalBuffer, ShmBuffer, ShmUpload,
};
use crate::caps::Capabilities;
use crate::dmabuf;
use crate::format::PixelFormatDescriptor;
use crate::gpu::{GpuDevice, GpuImage, GpuTexture, ShaderVariant, TextureDesc, TextureUpload};
use crate::sync::{ReleaseSlot, SyncFile};
use crate::{Result, SquallError};
use utils::log;
use utils::region::{Rect, Region};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Handle of a compositor surface
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Where a surface is in the buffer attachment process
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttachState {
    /// No buffer attached
    Unattached,
    /// A new buffer is being bound
    Attaching,
    Attached,
    /// The previous buffer was let go for a new one that could not be
    /// bound
    Detaching,
    /// The attached buffer was destroyed by its client
    Destroyed,
}

/// What attach needs from the renderer
pub(crate) struct AttachContext<'a> {
    pub dev: &'a Arc<dyn GpuDevice>,
    pub caps: Capabilities,
    pub registry: &'a mut BufferRegistry,
}

/// The parts of a client buffer attach works from
enum PendingAttach {
    Shm(ShmBuffer),
    Dmabuf,
    External(ExternalBuffer),
    Solid([f32; 4]),
    Unsupported,
}

/// Renderer state for one surface
pub struct SurfaceState {
    ss_id: SurfaceId,
    ss_state: AttachState,
    /// GPU state of the attached buffer
    ss_buffer_state: Option<Rc<RefCell<BufferState>>>,
    /// Our hold on the attached buffer. Shm states outlive this.
    ss_buffer: Option<ClientBuffer>,
    ss_acquire: Option<SyncFile>,
    ss_release: ReleaseSlot,
    /// Was this surface drawn in the repaint in progress
    ss_used_in_output_repaint: bool,
}

impl SurfaceState {
    pub(crate) fn new(id: SurfaceId) -> Self {
        Self {
            ss_id: id,
            ss_state: AttachState::Unattached,
            ss_buffer_state: None,
            ss_buffer: None,
            ss_acquire: None,
            ss_release: ReleaseSlot::new(),
            ss_used_in_output_repaint: false,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.ss_id
    }

    pub fn attach_state(&self) -> AttachState {
        self.ss_state
    }

    pub fn buffer_state(&self) -> Option<Rc<RefCell<BufferState>>> {
        self.ss_buffer_state.clone()
    }

    pub fn buffer(&self) -> Option<&ClientBuffer> {
        self.ss_buffer.as_ref()
    }

    pub fn used_in_output_repaint(&self) -> bool {
        self.ss_used_in_output_repaint
    }

    pub(crate) fn set_used_in_output_repaint(&mut self, used: bool) {
        self.ss_used_in_output_repaint = used;
    }

    pub fn has_acquire_fence(&self) -> bool {
        self.ss_acquire.is_some()
    }

    pub(crate) fn set_acquire_fence(&mut self, fence: Option<SyncFile>) {
        self.ss_acquire = fence;
    }

    pub(crate) fn take_acquire_fence(&mut self) -> Option<SyncFile> {
        self.ss_acquire.take()
    }

    pub(crate) fn release_slot(&mut self) -> &mut ReleaseSlot {
        &mut self.ss_release
    }

    /// Bind a new buffer to this surface, or detach with None
    ///
    /// Returns the release fence still outstanding for the previous
    /// buffer. Any failure is a protocol error, the owning client is
    /// disconnected and the surface is left with nothing attached. The
    /// outstanding release fence stays in the surface's release slot
    /// in that case.
    pub(crate) fn attach(
        &mut self,
        ctx: &mut AttachContext,
        buffer: Option<&ClientBuffer>,
    ) -> Result<Option<SyncFile>> {
        self.ss_acquire = None;

        let buffer = match buffer {
            Some(b) => b,
            None => {
                log::debug!("Detaching buffer from surface {:?}", self.ss_id);
                self.ss_buffer = None;
                self.ss_buffer_state = None;
                self.ss_state = AttachState::Unattached;
                return Ok(self.ss_release.take());
            }
        };

        let replacing = self.ss_state == AttachState::Attached;
        self.ss_state = AttachState::Attaching;

        match self.attach_buffer(ctx, buffer) {
            Ok(()) => {
                self.ss_buffer = Some(buffer.clone());
                self.ss_state = AttachState::Attached;
                Ok(self.ss_release.take())
            }
            Err(e) => {
                let msg = match e {
                    SquallError::UNSUPPORTED_SHM_FORMAT => "unsupported shm buffer format",
                    SquallError::UNSUPPORTED_BUFFER => "disconnecting due to unhandled buffer type",
                    _ => "could not import buffer",
                };
                buffer.terminate_client(msg);

                self.ss_buffer = None;
                self.ss_buffer_state = None;
                self.ss_state = match replacing {
                    true => AttachState::Detaching,
                    false => AttachState::Unattached,
                };
                Err(e)
            }
        }
    }

    fn attach_buffer(&mut self, ctx: &mut AttachContext, buffer: &ClientBuffer) -> Result<()> {
        // Everything but shm keeps its state on the buffer itself
        if let Some(state) = buffer.state() {
            log::debug!("Reusing state of buffer {}", buffer.id());
            self.ss_buffer_state = Some(state);
            return Ok(());
        }

        let (width, height) = buffer.size();
        // Copy out what we need, the buffer gets our new state below
        let pending = match &*buffer.kind() {
            BufferKind::Shm(shm) => PendingAttach::Shm(shm.clone()),
            BufferKind::Dmabuf(_) => PendingAttach::Dmabuf,
            BufferKind::External(ext) => PendingAttach::External(ext.clone()),
            BufferKind::Solid(color) => PendingAttach::Solid(*color),
            BufferKind::Unsupported => PendingAttach::Unsupported,
        };

        let state = match pending {
            PendingAttach::Shm(shm) => return self.attach_shm(ctx, width, height, &shm),
            PendingAttach::Dmabuf => dmabuf_buffer_state(ctx, buffer)?,
            PendingAttach::External(ext) => {
                let state = create_external_state(ctx, &ext, width, height)?;
                buffer.set_state(state.clone());
                state
            }
            PendingAttach::Solid(color) => {
                let mut state = BufferState::new(ShaderVariant::Solid, width, height);
                state.bs_color = color;
                let state = ctx.registry.register(state);
                buffer.set_state(state.clone());
                state
            }
            PendingAttach::Unsupported => return Err(SquallError::UNSUPPORTED_BUFFER),
        };

        self.ss_buffer_state = Some(state);
        Ok(())
    }

    /// Attach a shm buffer, reusing our current state if we can
    fn attach_shm(
        &mut self,
        ctx: &mut AttachContext,
        width: i32,
        height: i32,
        shm: &ShmBuffer,
    ) -> Result<()> {
        let desc = match PixelFormatDescriptor::lookup(shm.sb_format) {
            Some(d) if d.is_supported(ctx.caps) => d,
            _ => {
                log::error!("Unsupported shm format {:?}", shm.sb_format);
                return Err(SquallError::UNSUPPORTED_SHM_FORMAT);
            }
        };
        let offsets = desc.plane_offsets(shm.sb_offset, shm.sb_stride, height as u32);

        // Plane offsets only depend on the format, stride and height, so
        // matching geometry means only the pitch can differ.
        if let Some(state) = self.ss_buffer_state.as_ref() {
            let mut bs = state.borrow_mut();
            if bs.shm_matches(width, height, shm.sb_format) {
                if let Some(su) = bs.bs_shm.as_mut() {
                    if su.su_stride != shm.sb_stride {
                        su.su_needs_full_upload = true;
                    }
                    su.su_stride = shm.sb_stride;
                    su.su_offsets = offsets;
                }
                return Ok(());
            }
        }

        let mut state = BufferState::new(desc.variant, width, height);
        for (i, plane) in desc.planes.iter().enumerate() {
            let (w, h) = desc.plane_extent(i, width as u32, height as u32);
            state.bs_textures.push(GpuTexture::new(
                ctx.dev,
                &TextureDesc {
                    width: w,
                    height: h,
                    format: plane.format,
                },
            )?);
        }
        state.bs_shm = Some(ShmUpload {
            su_format: desc,
            su_stride: shm.sb_stride,
            su_offsets: offsets,
            su_damage: Region::new(),
            su_needs_full_upload: true,
        });

        log::debug!(
            "New {}x{} {:?} shm state for surface {:?}",
            width,
            height,
            shm.sb_format,
            self.ss_id
        );
        self.ss_buffer_state = Some(ctx.registry.register(state));
        Ok(())
    }

    /// Accumulate commit damage, in buffer pixels
    pub(crate) fn flush_damage(&mut self, damage: &Region) {
        if let Some(state) = self.ss_buffer_state.as_ref() {
            state.borrow_mut().add_damage(damage);
        }
    }

    /// Upload whatever shm damage has piled up since we were last drawn
    pub(crate) fn upload_pending(&mut self) -> Result<()> {
        let buffer = match self.ss_buffer.as_ref() {
            Some(b) => b,
            None => return Ok(()),
        };
        let state = match self.ss_buffer_state.as_ref() {
            Some(s) => s,
            None => return Ok(()),
        };
        let kind = buffer.kind();
        let shm = match &*kind {
            BufferKind::Shm(shm) => shm,
            _ => return Ok(()),
        };

        let mut bs = state.borrow_mut();
        let (width, height) = bs.size();
        let BufferState {
            bs_textures,
            bs_shm,
            ..
        } = &mut *bs;
        let su = match bs_shm.as_mut() {
            Some(su) => su,
            None => return Ok(()),
        };
        if !su.su_needs_full_upload && su.su_damage.is_empty() {
            return Ok(());
        }

        let desc = su.su_format;
        let full = su.su_needs_full_upload || desc.is_multi_plane();
        let pool = shm.sb_pool.borrow();

        for (i, tex) in bs_textures.iter().enumerate() {
            let data = match pool.get(su.su_offsets[i]..) {
                Some(d) => d,
                None => {
                    log::error!("shm plane {} starts past the end of its pool", i);
                    return Err(SquallError::DEVICE_ERROR);
                }
            };
            let rects = match full {
                true => {
                    let (w, h) = desc.plane_extent(i, width as u32, height as u32);
                    vec![Rect::new(0, 0, w as i32, h as i32)]
                }
                false => su.su_damage.rects().to_vec(),
            };

            for rect in rects.iter() {
                tex.upload(&TextureUpload {
                    rect: *rect,
                    row_length: desc.row_length(i, su.su_stride),
                    texel_size: desc.planes[i].texel_size,
                    data: data,
                })?;
            }
        }

        su.su_damage.clear();
        su.su_needs_full_upload = false;
        Ok(())
    }

    /// The client destroyed `buffer`
    pub(crate) fn buffer_destroyed(&mut self, buffer: &ClientBuffer) {
        let attached = match self.ss_buffer.as_ref() {
            Some(b) => b.ptr_eq(buffer),
            None => false,
        };
        if !attached {
            return;
        }

        self.ss_buffer = None;
        self.ss_state = AttachState::Destroyed;
        // Shm states stay around for the next buffer of the same size
        let keep = self
            .ss_buffer_state
            .as_ref()
            .map(|s| s.borrow().is_shm())
            .unwrap_or(false);
        if !keep {
            self.ss_buffer_state = None;
        }
    }

    /// Drop every reference we hold, the surface is going away
    pub(crate) fn release(&mut self) {
        if let Some(state) = self.ss_buffer_state.take() {
            if state.borrow().is_shm() {
                state.borrow_mut().release_gpu();
            }
        }
        self.ss_buffer = None;
        self.ss_acquire = None;
        self.ss_release.clear();
        self.ss_state = AttachState::Unattached;
    }
}

impl std::fmt::Debug for SurfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceState")
            .field("id", &self.ss_id)
            .field("state", &self.ss_state)
            .field("buffer", &self.ss_buffer)
            .finish()
    }
}

/// Import every plane of an external buffer
fn create_external_state(
    ctx: &mut AttachContext,
    ext: &ExternalBuffer,
    width: i32,
    height: i32,
) -> Result<Rc<RefCell<BufferState>>> {
    let variant = ext.eb_plane_format.variant();
    let mut state = BufferState::new(variant, width, height);

    for plane in 0..variant.plane_count() {
        let image = GpuImage::import_external(ctx.dev, ext.eb_handle, plane)?;
        state.bs_textures.push(GpuTexture::from_image(ctx.dev, &image)?);
        state.bs_images.push(image);
    }

    Ok(ctx.registry.register(state))
}

/// Get the state of a dmabuf buffer, importing it if this is the first
/// time we see it
pub(crate) fn dmabuf_buffer_state(
    ctx: &mut AttachContext,
    buffer: &ClientBuffer,
) -> Result<Rc<RefCell<BufferState>>> {
    if let Some(state) = buffer.state() {
        return Ok(state);
    }
    let (width, height) = buffer.size();

    let direct_display = match &*buffer.kind() {
        BufferKind::Dmabuf(d) => d.db_direct_display,
        _ => return Err(SquallError::UNSUPPORTED_BUFFER),
    };
    if direct_display {
        // We never get to see the contents, draw black instead
        let state = ctx
            .registry
            .register(BufferState::new(ShaderVariant::Solid, width, height));
        buffer.set_state(state.clone());
        return Ok(state);
    }

    let (image, y_inverted) = {
        let kind = buffer.kind();
        let dmabuf = match &*kind {
            BufferKind::Dmabuf(d) => d,
            _ => return Err(SquallError::UNSUPPORTED_BUFFER),
        };

        let image = match buffer.dmabuf_image() {
            Some(i) => i,
            None => Rc::new(dmabuf::import_dmabuf(ctx.dev, ctx.caps, dmabuf)?),
        };
        (image, dmabuf.is_y_inverted())
    };

    let mut state = BufferState::new(image.variant(), width, height);
    for img in image.images() {
        state.bs_textures.push(GpuTexture::from_image(ctx.dev, img)?);
    }
    state.bs_y_inverted = y_inverted;
    state.bs_dmabuf = Some(image.clone());

    let state = ctx.registry.register(state);
    buffer.set_dmabuf_image(&image);
    buffer.set_state(state.clone());
    log::debug!("Imported dmabuf buffer {}", buffer.id());
    Ok(state)
}
