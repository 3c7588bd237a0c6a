// Client buffers and their GPU state
//
// Austin Shafer - 2020
use drm_fourcc::DrmFourcc;

use crate::dmabuf::{Dmabuf, DmabufImage};
use crate::format::PixelFormatDescriptor;
use crate::gpu::{GpuImage, GpuTexture, ShaderVariant, TextureId};
use utils::log;
use utils::region::{Rect, Region};

use std::cell::{Ref, RefCell};
use std::rc::{Rc, Weak};

/// The client connection a buffer belongs to
///
/// Protocol errors are reported through this.
pub trait ClientHandle {
    /// Disconnect the client with this message
    fn terminate(&self, msg: &str);
    /// Tell the client the server failed to handle one of its objects
    fn post_implementation_error(&self, msg: &str);
}

/// The memory of a shm pool, shared by every buffer created from it
pub type ShmPool = Rc<RefCell<Vec<u8>>>;

/// A buffer allocated from a shm pool
#[derive(Debug, Clone)]
pub struct ShmBuffer {
    pub sb_pool: ShmPool,
    pub sb_offset: usize,
    pub sb_stride: u32,
    pub sb_format: DrmFourcc,
}

impl ShmBuffer {
    pub fn new(pool: ShmPool, offset: usize, stride: u32, format: DrmFourcc) -> Self {
        Self {
            sb_pool: pool,
            sb_offset: offset,
            sb_stride: stride,
            sb_format: format,
        }
    }
}

/// Plane layouts of externally rendered buffers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExternalPlaneFormat {
    Rgb,
    Rgba,
    External,
    YUv,
    YUV,
    YXuxv,
}

impl ExternalPlaneFormat {
    pub fn variant(&self) -> ShaderVariant {
        match self {
            ExternalPlaneFormat::Rgb => ShaderVariant::Rgbx,
            ExternalPlaneFormat::Rgba => ShaderVariant::Rgba,
            ExternalPlaneFormat::External => ShaderVariant::External,
            ExternalPlaneFormat::YUv => ShaderVariant::YUv,
            ExternalPlaneFormat::YUV => ShaderVariant::YUV,
            ExternalPlaneFormat::YXuxv => ShaderVariant::YXuxv,
        }
    }
}

/// A buffer rendered by some other API, imported plane by plane
#[derive(Debug, Clone)]
pub struct ExternalBuffer {
    pub eb_handle: u64,
    pub eb_plane_format: ExternalPlaneFormat,
}

/// The kinds of buffers clients can attach
#[derive(Debug)]
pub enum BufferKind {
    Shm(ShmBuffer),
    Dmabuf(Dmabuf),
    External(ExternalBuffer),
    Solid([f32; 4]),
    /// Anything we don't know how to handle
    Unsupported,
}

/// State kept for uploading shm contents
#[derive(Debug)]
pub(crate) struct ShmUpload {
    pub su_format: &'static PixelFormatDescriptor,
    pub su_stride: u32,
    /// Byte offsets of every plane in the pool
    pub su_offsets: Vec<usize>,
    /// Damage not uploaded yet, in buffer pixels
    pub su_damage: Region,
    pub su_needs_full_upload: bool,
}

/// GPU resources for one client buffer
///
/// Shm states are owned by the surface they are attached to and
/// reused in place for buffers of the same size and format. All other
/// states belong to the client buffer and are shared by every surface
/// it is attached to.
pub struct BufferState {
    bs_serial: u64,
    bs_width: i32,
    bs_height: i32,
    pub(crate) bs_variant: ShaderVariant,
    pub(crate) bs_color: [f32; 4],
    pub(crate) bs_y_inverted: bool,
    pub(crate) bs_textures: Vec<GpuTexture>,
    /// Images of external imports
    pub(crate) bs_images: Vec<GpuImage>,
    /// Dmabuf imports belong to the client buffer, we only reference them
    pub(crate) bs_dmabuf: Option<Rc<DmabufImage>>,
    pub(crate) bs_shm: Option<ShmUpload>,
}

impl BufferState {
    pub(crate) fn new(variant: ShaderVariant, width: i32, height: i32) -> Self {
        Self {
            bs_serial: 0,
            bs_width: width,
            bs_height: height,
            bs_variant: variant,
            bs_color: [0.0, 0.0, 0.0, 1.0],
            bs_y_inverted: false,
            bs_textures: Vec::new(),
            bs_images: Vec::new(),
            bs_dmabuf: None,
            bs_shm: None,
        }
    }

    /// Unique id, stays the same while the state is reused
    pub fn serial(&self) -> u64 {
        self.bs_serial
    }

    pub fn size(&self) -> (i32, i32) {
        (self.bs_width, self.bs_height)
    }

    pub fn variant(&self) -> ShaderVariant {
        self.bs_variant
    }

    pub fn color(&self) -> [f32; 4] {
        self.bs_color
    }

    pub fn is_y_inverted(&self) -> bool {
        self.bs_y_inverted
    }

    pub fn texture_ids(&self) -> Vec<TextureId> {
        self.bs_textures.iter().map(|t| t.id()).collect()
    }

    pub fn image_count(&self) -> usize {
        self.bs_images.len() + self.bs_dmabuf.as_ref().map(|d| d.image_count()).unwrap_or(0)
    }

    pub fn is_shm(&self) -> bool {
        self.bs_shm.is_some()
    }

    pub fn needs_full_upload(&self) -> bool {
        self.bs_shm
            .as_ref()
            .map(|s| s.su_needs_full_upload)
            .unwrap_or(false)
    }

    /// Shm damage waiting to be uploaded
    pub fn pending_damage(&self) -> Option<&Region> {
        self.bs_shm.as_ref().map(|s| &s.su_damage)
    }

    /// Does this shm state have the same geometry as `shm`
    pub(crate) fn shm_matches(&self, width: i32, height: i32, format: DrmFourcc) -> bool {
        match self.bs_shm.as_ref() {
            Some(s) => {
                self.bs_width == width && self.bs_height == height && s.su_format.fourcc == format
            }
            None => false,
        }
    }

    /// Accumulate shm damage
    pub(crate) fn add_damage(&mut self, damage: &Region) {
        let extent = Rect::new(0, 0, self.bs_width, self.bs_height);
        if let Some(shm) = self.bs_shm.as_mut() {
            let mut clipped = damage.clone();
            clipped.intersect_rect(&extent);
            shm.su_damage.union(&clipped);
        }
    }

    /// Is this state ready to be sampled from
    pub(crate) fn is_drawable(&self) -> bool {
        self.bs_textures.len() == self.bs_variant.plane_count()
    }

    /// Drop every GPU handle this state holds
    pub(crate) fn release_gpu(&mut self) {
        if !self.bs_textures.is_empty() || self.bs_dmabuf.is_some() || !self.bs_images.is_empty() {
            log::debug!("Releasing GPU resources of buffer state {}", self.bs_serial);
        }
        self.bs_textures.clear();
        self.bs_images.clear();
        self.bs_dmabuf = None;
    }
}

impl std::fmt::Debug for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferState")
            .field("serial", &self.bs_serial)
            .field("size", &(self.bs_width, self.bs_height))
            .field("variant", &self.bs_variant)
            .field("textures", &self.bs_textures)
            .finish()
    }
}

/// Tracks every live BufferState so their GPU resources can be
/// released before the device goes away
#[derive(Default)]
pub(crate) struct BufferRegistry {
    br_states: Vec<Weak<RefCell<BufferState>>>,
    br_next_serial: u64,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mut state: BufferState) -> Rc<RefCell<BufferState>> {
        self.br_next_serial += 1;
        state.bs_serial = self.br_next_serial;

        let ret = Rc::new(RefCell::new(state));
        self.br_states.retain(|w| w.strong_count() > 0);
        self.br_states.push(Rc::downgrade(&ret));
        ret
    }

    pub fn live_count(&self) -> usize {
        self.br_states.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Release the GPU resources of every state still alive
    pub fn release_all(&mut self) {
        for weak in self.br_states.drain(..) {
            if let Some(state) = weak.upgrade() {
                state.borrow_mut().release_gpu();
            }
        }
    }
}

struct ClientBufferInternal {
    cb_id: u64,
    cb_kind: BufferKind,
    cb_width: i32,
    cb_height: i32,
    /// Per resource state for everything but shm
    cb_state: Option<Rc<RefCell<BufferState>>>,
    /// The import is owned by the buffer state, so releasing the state
    /// frees it
    cb_dmabuf_image: Weak<DmabufImage>,
    cb_destroyed: bool,
    cb_client: Option<Rc<dyn ClientHandle>>,
}

/// A buffer a client committed
///
/// Cloning this takes another reference to the same buffer. Surfaces
/// hold one for the buffer they have attached.
#[derive(Clone)]
pub struct ClientBuffer {
    cb_internal: Rc<RefCell<ClientBufferInternal>>,
}

impl ClientBuffer {
    pub fn new(id: u64, kind: BufferKind, width: i32, height: i32) -> Self {
        Self {
            cb_internal: Rc::new(RefCell::new(ClientBufferInternal {
                cb_id: id,
                cb_kind: kind,
                cb_width: width,
                cb_height: height,
                cb_state: None,
                cb_dmabuf_image: Weak::new(),
                cb_destroyed: false,
                cb_client: None,
            })),
        }
    }

    pub fn new_shm(id: u64, shm: ShmBuffer, width: i32, height: i32) -> Self {
        Self::new(id, BufferKind::Shm(shm), width, height)
    }

    pub fn new_dmabuf(id: u64, dmabuf: Dmabuf) -> Self {
        let (w, h) = (dmabuf.db_width, dmabuf.db_height);
        Self::new(id, BufferKind::Dmabuf(dmabuf), w, h)
    }

    pub fn new_external(id: u64, ext: ExternalBuffer, width: i32, height: i32) -> Self {
        Self::new(id, BufferKind::External(ext), width, height)
    }

    pub fn new_solid(id: u64, color: [f32; 4], width: i32, height: i32) -> Self {
        Self::new(id, BufferKind::Solid(color), width, height)
    }

    /// Attach the client connection this buffer belongs to
    pub fn with_client(self, client: Rc<dyn ClientHandle>) -> Self {
        self.cb_internal.borrow_mut().cb_client = Some(client);
        self
    }

    pub fn id(&self) -> u64 {
        self.cb_internal.borrow().cb_id
    }

    pub fn size(&self) -> (i32, i32) {
        let internal = self.cb_internal.borrow();
        (internal.cb_width, internal.cb_height)
    }

    pub fn kind(&self) -> Ref<BufferKind> {
        Ref::map(self.cb_internal.borrow(), |i| &i.cb_kind)
    }

    pub fn is_destroyed(&self) -> bool {
        self.cb_internal.borrow().cb_destroyed
    }

    /// The GPU state owned by this buffer, if it has one
    pub fn state(&self) -> Option<Rc<RefCell<BufferState>>> {
        self.cb_internal.borrow().cb_state.clone()
    }

    pub fn has_dmabuf_import(&self) -> bool {
        self.cb_internal.borrow().cb_dmabuf_image.strong_count() > 0
    }

    /// Number of references held on this buffer, including this one
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.cb_internal)
    }

    pub fn ptr_eq(&self, other: &ClientBuffer) -> bool {
        Rc::ptr_eq(&self.cb_internal, &other.cb_internal)
    }

    pub(crate) fn set_state(&self, state: Rc<RefCell<BufferState>>) {
        self.cb_internal.borrow_mut().cb_state = Some(state);
    }

    pub(crate) fn dmabuf_image(&self) -> Option<Rc<DmabufImage>> {
        self.cb_internal.borrow().cb_dmabuf_image.upgrade()
    }

    pub(crate) fn set_dmabuf_image(&self, image: &Rc<DmabufImage>) {
        self.cb_internal.borrow_mut().cb_dmabuf_image = Rc::downgrade(image);
    }

    /// Report a protocol error and disconnect the owning client
    pub(crate) fn terminate_client(&self, msg: &str) {
        log::error!("Buffer {}: {}", self.id(), msg);
        let client = self.cb_internal.borrow().cb_client.clone();
        if let Some(client) = client {
            client.terminate(msg);
        }
    }

    pub(crate) fn post_implementation_error(&self, msg: &str) {
        log::error!("Buffer {}: {}", self.id(), msg);
        let client = self.cb_internal.borrow().cb_client.clone();
        if let Some(client) = client {
            client.post_implementation_error(msg);
        }
    }

    /// Drop the per resource GPU state, the buffer is going away
    pub(crate) fn mark_destroyed(&self) {
        let mut internal = self.cb_internal.borrow_mut();
        internal.cb_destroyed = true;
        if let Some(state) = internal.cb_state.take() {
            state.borrow_mut().release_gpu();
        }
        internal.cb_dmabuf_image = Weak::new();
    }
}

impl std::fmt::Debug for ClientBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let internal = self.cb_internal.borrow();
        f.debug_struct("ClientBuffer")
            .field("id", &internal.cb_id)
            .field("size", &(internal.cb_width, internal.cb_height))
            .field("destroyed", &internal.cb_destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_live_states() {
        let mut reg = BufferRegistry::new();
        let a = reg.register(BufferState::new(ShaderVariant::Solid, 1, 1));
        let b = reg.register(BufferState::new(ShaderVariant::Solid, 1, 1));
        assert_ne!(a.borrow().serial(), b.borrow().serial());
        assert_eq!(reg.live_count(), 2);

        drop(a);
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn shm_damage_is_clipped_to_buffer() {
        let mut state = BufferState::new(ShaderVariant::Rgba, 10, 10);
        state.bs_shm = Some(ShmUpload {
            su_format: PixelFormatDescriptor::lookup(DrmFourcc::Argb8888).unwrap(),
            su_stride: 40,
            su_offsets: vec![0],
            su_damage: Region::new(),
            su_needs_full_upload: false,
        });

        state.add_damage(&Region::from_rect(Rect::new(5, 5, 20, 20)));
        assert_eq!(
            state.pending_damage().unwrap(),
            &Region::from_rect(Rect::new(5, 5, 5, 5))
        );
        assert!(state.shm_matches(10, 10, DrmFourcc::Argb8888));
        assert!(!state.shm_matches(10, 10, DrmFourcc::Xrgb8888));
    }

    #[test]
    fn solid_buffers_hold_no_state_before_attach() {
        let buf = ClientBuffer::new_solid(3, [1.0; 4], 4, 4);
        assert!(buf.state().is_none());
        assert_eq!(buf.size(), (4, 4));
        assert_eq!(buf.ref_count(), 1);
        let other = buf.clone();
        assert!(other.ptr_eq(&buf));
        assert_eq!(buf.ref_count(), 2);
    }
}
