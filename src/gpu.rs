// The GPU device interface
//
// Squall never talks to a graphics API directly, it records
// everything through the GpuDevice trait. Display backends implement
// it on top of their API of choice.
//
// Austin Shafer - 2024
use ash::vk;
use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::caps::Capabilities;
use crate::config::ContextPriority;
use crate::sync::SyncFile;
use crate::Result;
use utils::log;
use utils::region::Rect;

use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Handle to a texture owned by the device
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Handle to an imported image (dmabuf or external)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

/// Handle to a render target
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u64);

/// Handle to a GPU timestamp query
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
}

/// A sub-rectangle upload into a texture
///
/// `data` starts at the first texel of the plane, `rect` is in texels.
/// Rows are `row_length` texels apart.
#[derive(Debug)]
pub struct TextureUpload<'a> {
    pub rect: Rect<i32>,
    pub row_length: u32,
    pub texel_size: u32,
    pub data: &'a [u8],
}

#[derive(Debug)]
pub struct DmabufPlaneDesc<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: u32,
}

/// Everything the device needs to import one dmabuf image
#[derive(Debug)]
pub struct DmabufImportDesc<'a> {
    pub fourcc: DrmFourcc,
    pub width: u32,
    pub height: u32,
    pub modifier: DrmModifier,
    pub planes: Vec<DmabufPlaneDesc<'a>>,
}

/// What a render target is used for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetKind {
    /// Backed by the display's presentation engine. These have a
    /// buffer age and can be presented.
    Presentation,
    /// An offscreen image. Used for shadow buffers, border
    /// textures and virtual outputs.
    Offscreen,
}

/// The sampling and conversion strategy for a buffer's pixel format
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShaderVariant {
    /// A single color, no textures
    Solid,
    /// RGB with alpha forced to 1.0
    Rgbx,
    /// Premultiplied RGBA
    Rgba,
    /// A single image sampled through the external sampler
    External,
    /// Y plane plus an interleaved UV plane
    YUv,
    /// Separate Y, U and V planes
    YUV,
    /// Y sampled from an RG texture, UV from a BGRA view of the same memory
    YXuxv,
}

impl ShaderVariant {
    /// Number of textures a buffer using this variant is sampled from
    pub fn plane_count(&self) -> usize {
        match self {
            ShaderVariant::Solid => 0,
            ShaderVariant::Rgbx | ShaderVariant::Rgba | ShaderVariant::External => 1,
            ShaderVariant::YUv | ShaderVariant::YXuxv => 2,
            ShaderVariant::YUV => 3,
        }
    }
}

/// Everything needed to select and set up a shader for a draw
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderConfig {
    pub variant: ShaderVariant,
    pub textures: Vec<TextureId>,
    /// Only used by the Solid variant
    pub color: [f32; 4],
    pub alpha: f32,
    pub y_invert: bool,
    /// Debug tint mixed into the result
    pub tint: Option<[f32; 4]>,
}

impl ShaderConfig {
    pub fn solid(color: [f32; 4]) -> Self {
        Self {
            variant: ShaderVariant::Solid,
            textures: Vec::new(),
            color: color,
            alpha: 1.0,
            y_invert: false,
            tint: None,
        }
    }

    pub fn textured(variant: ShaderVariant, textures: Vec<TextureId>) -> Self {
        Self {
            variant: variant,
            textures: textures,
            color: [0.0; 4],
            alpha: 1.0,
            y_invert: false,
            tint: None,
        }
    }
}

/// A vertex of a triangle fan
///
/// `pos` is in framebuffer pixels, `tex` is in normalized texture
/// coordinates.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
#[repr(C)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub tex: [f32; 2],
}

impl Vertex {
    pub fn new(x: f32, y: f32, s: f32, t: f32) -> Self {
        Self {
            pos: [x, y],
            tex: [s, t],
        }
    }
}

/// The GPU device interface
///
/// All commands are recorded into a single serialized queue. Fences
/// created from the device therefore signal in creation order.
pub trait GpuDevice: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Request a context priority, returns the priority actually granted
    fn set_context_priority(&self, prio: ContextPriority) -> ContextPriority;

    /// Can this format be used as a render target
    fn supports_render_format(&self, format: vk::Format) -> bool;

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId>;
    fn upload_texture(&self, tex: TextureId, upload: &TextureUpload) -> Result<()>;
    fn destroy_texture(&self, tex: TextureId);

    /// Import a dmabuf as a single image
    ///
    /// Returns the image and whether it may only be sampled through the
    /// external sampler.
    fn import_dmabuf(&self, desc: &DmabufImportDesc) -> Result<(ImageId, bool)>;
    /// Import one plane of an externally rendered buffer
    fn import_external(&self, handle: u64, plane: usize) -> Result<ImageId>;
    fn destroy_image(&self, image: ImageId);
    /// Create a texture sampling an imported image
    fn texture_from_image(&self, image: ImageId) -> Result<TextureId>;

    /// The dmabuf formats the device can import, None if it can't be asked
    fn query_dmabuf_formats(&self) -> Option<Vec<DrmFourcc>>;
    fn query_dmabuf_modifiers(&self, fourcc: DrmFourcc) -> Vec<DrmModifier>;

    fn create_target(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        kind: TargetKind,
    ) -> Result<TargetId>;
    fn destroy_target(&self, target: TargetId);
    /// A texture sampling the contents of a target
    fn target_texture(&self, target: TargetId) -> Result<TextureId>;

    /// Make the target current. Nothing may be recorded for a target
    /// which is not current.
    fn make_current(&self, target: TargetId) -> Result<()>;
    fn bind_target(&self, target: TargetId, viewport: &Rect<i32>);
    /// Age of the target's current back buffer, 0 if unknown
    fn buffer_age(&self, target: TargetId) -> u32;
    /// Partial update hint for the current back buffer
    fn set_damage_region(&self, target: TargetId, rects: &[vk::RectLayerKHR]);

    fn use_shader(&self, config: &ShaderConfig) -> Result<()>;
    /// A minimal shader which can always be used
    fn use_fallback_shader(&self);
    fn set_blend(&self, enable: bool);
    /// Draw fans of `fan_lengths[i]` consecutive vertices each
    fn draw_triangle_fans(&self, vertices: &[Vertex], fan_lengths: &[u32]);
    fn draw_lines(&self, vertices: &[Vertex], color: [f32; 4]);

    /// Submit what has been recorded and get a fence for it
    ///
    /// None if native fences are not supported.
    fn create_fence(&self) -> Option<SyncFile>;
    /// Make the GPU wait for a fence before any further commands
    fn wait_sync_file(&self, fence: &SyncFile) -> Result<()>;
    fn sync_file_signaled(&self, fence: &SyncFile) -> bool;

    /// Record a timestamp at this point of the command stream
    fn write_timestamp(&self) -> Result<QueryId>;
    /// The timestamp in nanoseconds, None if it isn't available yet
    fn get_timestamp(&self, query: QueryId) -> Result<Option<u64>>;
    fn destroy_query(&self, query: QueryId);

    /// Read back a rectangle of the target
    ///
    /// Rows are returned bottom to top unless the device supports
    /// `PACK_REVERSE_ROW_ORDER`.
    fn read_pixels(
        &self,
        target: TargetId,
        rect: &Rect<i32>,
        format: vk::Format,
        stride: u32,
        out: &mut [u8],
    ) -> Result<()>;
    /// Export the target's memory so another process can consume it
    fn export_target(&self, target: TargetId) -> Result<(OwnedFd, u32)>;
    fn present(&self, target: TargetId, damage: Option<&[vk::RectLayerKHR]>) -> Result<()>;
}

/// A texture which is destroyed when dropped
pub struct GpuTexture {
    t_dev: Arc<dyn GpuDevice>,
    t_id: TextureId,
}

impl GpuTexture {
    pub fn new(dev: &Arc<dyn GpuDevice>, desc: &TextureDesc) -> Result<Self> {
        let id = dev.create_texture(desc)?;
        Ok(Self {
            t_dev: dev.clone(),
            t_id: id,
        })
    }

    pub fn from_image(dev: &Arc<dyn GpuDevice>, image: &GpuImage) -> Result<Self> {
        let id = dev.texture_from_image(image.id())?;
        Ok(Self {
            t_dev: dev.clone(),
            t_id: id,
        })
    }

    pub fn from_target(dev: &Arc<dyn GpuDevice>, target: &RenderTarget) -> Result<Self> {
        let id = dev.target_texture(target.id())?;
        Ok(Self {
            t_dev: dev.clone(),
            t_id: id,
        })
    }

    pub fn id(&self) -> TextureId {
        self.t_id
    }

    pub fn upload(&self, upload: &TextureUpload) -> Result<()> {
        self.t_dev.upload_texture(self.t_id, upload)
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        log::debug!("Destroying texture {:?}", self.t_id);
        self.t_dev.destroy_texture(self.t_id);
    }
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GpuTexture").field(&self.t_id).finish()
    }
}

/// An imported image which is destroyed when dropped
pub struct GpuImage {
    i_dev: Arc<dyn GpuDevice>,
    i_id: ImageId,
    /// Can only be sampled with the external sampler
    i_external_only: bool,
}

impl GpuImage {
    pub fn import_dmabuf(dev: &Arc<dyn GpuDevice>, desc: &DmabufImportDesc) -> Result<Self> {
        let (id, external_only) = dev.import_dmabuf(desc)?;
        Ok(Self {
            i_dev: dev.clone(),
            i_id: id,
            i_external_only: external_only,
        })
    }

    pub fn import_external(dev: &Arc<dyn GpuDevice>, handle: u64, plane: usize) -> Result<Self> {
        let id = dev.import_external(handle, plane)?;
        Ok(Self {
            i_dev: dev.clone(),
            i_id: id,
            i_external_only: false,
        })
    }

    pub fn id(&self) -> ImageId {
        self.i_id
    }

    pub fn is_external_only(&self) -> bool {
        self.i_external_only
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        log::debug!("Destroying image {:?}", self.i_id);
        self.i_dev.destroy_image(self.i_id);
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GpuImage").field(&self.i_id).finish()
    }
}

/// A render target which is destroyed when dropped
pub struct RenderTarget {
    rt_dev: Arc<dyn GpuDevice>,
    rt_id: TargetId,
    rt_width: u32,
    rt_height: u32,
    rt_format: vk::Format,
    rt_kind: TargetKind,
}

impl RenderTarget {
    pub fn new(
        dev: &Arc<dyn GpuDevice>,
        width: u32,
        height: u32,
        format: vk::Format,
        kind: TargetKind,
    ) -> Result<Self> {
        let id = dev.create_target(width, height, format, kind)?;
        log::debug!(
            "Created {:?} target {:?} of size {}x{}",
            kind,
            id,
            width,
            height
        );

        Ok(Self {
            rt_dev: dev.clone(),
            rt_id: id,
            rt_width: width,
            rt_height: height,
            rt_format: format,
            rt_kind: kind,
        })
    }

    pub fn id(&self) -> TargetId {
        self.rt_id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.rt_width, self.rt_height)
    }

    pub fn format(&self) -> vk::Format {
        self.rt_format
    }

    pub fn kind(&self) -> TargetKind {
        self.rt_kind
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        log::debug!("Destroying target {:?}", self.rt_id);
        self.rt_dev.destroy_target(self.rt_id);
    }
}

impl std::fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("id", &self.rt_id)
            .field("size", &(self.rt_width, self.rt_height))
            .field("kind", &self.rt_kind)
            .finish()
    }
}
