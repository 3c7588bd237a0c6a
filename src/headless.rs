// Headless GPU device
//
// This backs headless outputs and the test-suite. Nothing is
// rasterized, instead every command is recorded so it can be
// inspected afterwards. Fences are backed by pipes and signal in
// timeline order when the owner says the GPU has caught up.
//
// Austin Shafer - 2024
use ash::vk;
use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::caps::Capabilities;
use crate::config::ContextPriority;
use crate::gpu::*;
use crate::sync::SyncFile;
use crate::{Result, SquallError};
use utils::log;
use utils::region::Rect;

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::os::fd::OwnedFd;
use std::sync::Mutex;

/// Number of back buffers in a headless presentation target
const SWAPCHAIN_LEN: usize = 2;

/// A command recorded by the headless device
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    MakeCurrent(TargetId),
    BindTarget(TargetId, Rect<i32>),
    SetDamageRegion(TargetId, Vec<Rect<i32>>),
    UseShader(ShaderConfig),
    UseFallbackShader,
    SetBlend(bool),
    DrawFans {
        target: Option<TargetId>,
        vertices: Vec<Vertex>,
        fans: Vec<u32>,
    },
    DrawLines {
        target: Option<TargetId>,
        count: usize,
    },
    Upload {
        texture: TextureId,
        rect: Rect<i32>,
    },
    WaitSyncFile(u64),
    CreateFence(u64),
    WriteTimestamp(QueryId),
    ReadPixels(TargetId, Rect<i32>),
    Present {
        target: TargetId,
        damage: Option<Vec<Rect<i32>>>,
    },
}

struct HeadlessTarget {
    ht_width: u32,
    ht_height: u32,
    ht_kind: TargetKind,
    /// The present count each back buffer was last presented at
    ht_last_present: [Option<u64>; SWAPCHAIN_LEN],
    ht_present_count: u64,
}

impl HeadlessTarget {
    fn back_buffer(&self) -> usize {
        (self.ht_present_count % SWAPCHAIN_LEN as u64) as usize
    }

    fn age(&self) -> u32 {
        match self.ht_last_present[self.back_buffer()] {
            Some(last) => (self.ht_present_count + 1 - last) as u32,
            None => 0,
        }
    }
}

struct HeadlessInternal {
    h_next_id: u64,
    h_textures: HashMap<u64, TextureDesc>,
    h_images: HashSet<u64>,
    h_targets: HashMap<u64, HeadlessTarget>,
    /// Query id to the timeline point it was recorded before
    h_queries: HashMap<u64, u64>,
    h_current: Option<TargetId>,
    h_bound: Option<TargetId>,
    h_commands: Vec<GpuCommand>,
    /// Last timeline point handed out
    h_submitted: u64,
    /// Last timeline point the GPU finished
    h_signaled: u64,
    /// Write ends of the pipes backing unsignaled fences
    h_pending: Vec<(u64, OwnedFd)>,
    h_priority: ContextPriority,
    /// Test knobs
    h_forced_age: Option<u32>,
    h_target_budget: Option<usize>,
    h_import_budget: Option<usize>,
    h_broken_variants: HashSet<ShaderVariant>,
    h_fail_make_current: bool,
    h_fail_read_pixels: bool,
    h_fail_export: bool,
    h_dmabuf_formats: Option<Vec<DrmFourcc>>,
    h_external_only: Vec<DrmFourcc>,
}

impl HeadlessInternal {
    fn alloc_id(&mut self) -> u64 {
        self.h_next_id += 1;
        self.h_next_id
    }

    fn record(&mut self, cmd: GpuCommand) {
        log::trace!("headless: {:?}", cmd);
        self.h_commands.push(cmd);
    }
}

/// The headless GPU device
pub struct HeadlessDevice {
    h_caps: Capabilities,
    h_internal: Mutex<HeadlessInternal>,
}

fn to_rects(rects: &[vk::RectLayerKHR]) -> Vec<Rect<i32>> {
    rects
        .iter()
        .map(|r| {
            Rect::new(
                r.offset.x,
                r.offset.y,
                r.extent.width as i32,
                r.extent.height as i32,
            )
        })
        .collect()
}

/// Single image dmabuf formats the headless device can import
const SIMPLE_DMABUF_FORMATS: &[DrmFourcc] = &[
    DrmFourcc::Argb8888,
    DrmFourcc::Xrgb8888,
    DrmFourcc::Abgr8888,
    DrmFourcc::Xbgr8888,
    DrmFourcc::R8,
    DrmFourcc::Gr88,
];

impl HeadlessDevice {
    pub fn new(caps: Capabilities) -> Self {
        let formats = match caps.contains(Capabilities::DMABUF_IMPORT) {
            true => Some(vec![
                DrmFourcc::Argb8888,
                DrmFourcc::Xrgb8888,
                DrmFourcc::Nv12,
                DrmFourcc::Yuv420,
            ]),
            false => None,
        };

        Self {
            h_caps: caps,
            h_internal: Mutex::new(HeadlessInternal {
                h_next_id: 0,
                h_textures: HashMap::new(),
                h_images: HashSet::new(),
                h_targets: HashMap::new(),
                h_queries: HashMap::new(),
                h_current: None,
                h_bound: None,
                h_commands: Vec::new(),
                h_submitted: 0,
                h_signaled: 0,
                h_pending: Vec::new(),
                h_priority: ContextPriority::Medium,
                h_forced_age: None,
                h_target_budget: None,
                h_import_budget: None,
                h_broken_variants: HashSet::new(),
                h_fail_make_current: false,
                h_fail_read_pixels: false,
                h_fail_export: false,
                h_dmabuf_formats: formats,
                h_external_only: Vec::new(),
            }),
        }
    }

    /// Everything recorded so far
    pub fn commands(&self) -> Vec<GpuCommand> {
        self.h_internal.lock().unwrap().h_commands.clone()
    }

    pub fn clear_commands(&self) {
        self.h_internal.lock().unwrap().h_commands.clear();
    }

    /// Number of textures, images, targets and queries still alive
    pub fn live_object_count(&self) -> usize {
        let internal = self.h_internal.lock().unwrap();
        internal.h_textures.len()
            + internal.h_images.len()
            + internal.h_targets.len()
            + internal.h_queries.len()
    }

    pub fn live_texture_ids(&self) -> Vec<TextureId> {
        let internal = self.h_internal.lock().unwrap();
        let mut ret: Vec<TextureId> = internal.h_textures.keys().map(|k| TextureId(*k)).collect();
        ret.sort();
        ret
    }

    /// Pretend the GPU finished everything up to `point`
    pub fn signal_to(&self, point: u64) {
        let mut internal = self.h_internal.lock().unwrap();
        let point = point.min(internal.h_submitted);
        if point <= internal.h_signaled {
            return;
        }
        internal.h_signaled = point;

        // Signal in timeline order
        internal.h_pending.sort_by_key(|(p, _)| *p);
        let pending = std::mem::take(&mut internal.h_pending);
        for (p, fd) in pending.into_iter() {
            if p <= point {
                if let Err(e) = std::fs::File::from(fd).write_all(&[1]) {
                    log::error!("headless: could not signal fence {}: {:?}", p, e);
                }
            } else {
                internal.h_pending.push((p, fd));
            }
        }
    }

    /// Pretend the GPU is idle
    pub fn signal_all(&self) {
        let submitted = self.h_internal.lock().unwrap().h_submitted;
        self.signal_to(submitted);
    }

    pub fn last_signaled(&self) -> u64 {
        self.h_internal.lock().unwrap().h_signaled
    }

    /// Report this age for every presentation target instead of
    /// tracking it
    pub fn force_buffer_age(&self, age: Option<u32>) {
        self.h_internal.lock().unwrap().h_forced_age = age;
    }

    /// Only allow `count` more render targets to be created
    pub fn limit_target_creation(&self, count: Option<usize>) {
        self.h_internal.lock().unwrap().h_target_budget = count;
    }

    /// Only allow `count` more dmabuf imports to succeed
    pub fn limit_dmabuf_imports(&self, count: Option<usize>) {
        self.h_internal.lock().unwrap().h_import_budget = count;
    }

    /// Make shaders of this variant fail to compile
    pub fn break_shader(&self, variant: ShaderVariant) {
        self.h_internal
            .lock()
            .unwrap()
            .h_broken_variants
            .insert(variant);
    }

    pub fn fail_make_current(&self, fail: bool) {
        self.h_internal.lock().unwrap().h_fail_make_current = fail;
    }

    pub fn fail_read_pixels(&self, fail: bool) {
        self.h_internal.lock().unwrap().h_fail_read_pixels = fail;
    }

    pub fn fail_export(&self, fail: bool) {
        self.h_internal.lock().unwrap().h_fail_export = fail;
    }

    /// Change what the dmabuf format query returns. None means the
    /// query is not available.
    pub fn set_dmabuf_formats(&self, formats: Option<Vec<DrmFourcc>>) {
        self.h_internal.lock().unwrap().h_dmabuf_formats = formats;
    }

    /// Dmabufs of this format import as external-only images
    pub fn set_external_only(&self, fourcc: DrmFourcc) {
        self.h_internal
            .lock()
            .unwrap()
            .h_external_only
            .push(fourcc);
    }

    pub fn context_priority(&self) -> ContextPriority {
        self.h_internal.lock().unwrap().h_priority
    }
}

impl GpuDevice for HeadlessDevice {
    fn capabilities(&self) -> Capabilities {
        self.h_caps
    }

    fn set_context_priority(&self, prio: ContextPriority) -> ContextPriority {
        // We can't grant realtime
        let granted = match prio {
            ContextPriority::Realtime => ContextPriority::High,
            p => p,
        };
        self.h_internal.lock().unwrap().h_priority = granted;
        granted
    }

    fn supports_render_format(&self, format: vk::Format) -> bool {
        match format {
            vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM => true,
            vk::Format::A2R10G10B10_UNORM_PACK32 | vk::Format::A2B10G10R10_UNORM_PACK32 => {
                self.h_caps.contains(Capabilities::TEXTURE_2101010)
            }
            vk::Format::R16G16B16A16_SFLOAT => self.h_caps.contains(Capabilities::TEXTURE_16BIT),
            _ => false,
        }
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(SquallError::DEVICE_ERROR);
        }
        let mut internal = self.h_internal.lock().unwrap();
        let id = internal.alloc_id();
        internal.h_textures.insert(id, *desc);
        Ok(TextureId(id))
    }

    fn upload_texture(&self, tex: TextureId, upload: &TextureUpload) -> Result<()> {
        let mut internal = self.h_internal.lock().unwrap();
        let desc = internal
            .h_textures
            .get(&tex.0)
            .ok_or(SquallError::DEVICE_ERROR)?;

        let extent = Rect::new(0, 0, desc.width as i32, desc.height as i32);
        if !extent.contains_rect(&upload.rect) {
            log::error!("headless: upload {:?} out of bounds", upload.rect);
            return Err(SquallError::DEVICE_ERROR);
        }

        // The last texel read must be inside of the client data
        let last_row = (upload.rect.y2() - 1).max(0) as usize;
        let end = (last_row * upload.row_length as usize + upload.rect.x2() as usize)
            * upload.texel_size as usize;
        if end > upload.data.len() {
            log::error!("headless: upload reads past the end of the buffer");
            return Err(SquallError::DEVICE_ERROR);
        }

        internal.record(GpuCommand::Upload {
            texture: tex,
            rect: upload.rect,
        });
        Ok(())
    }

    fn destroy_texture(&self, tex: TextureId) {
        self.h_internal.lock().unwrap().h_textures.remove(&tex.0);
    }

    fn import_dmabuf(&self, desc: &DmabufImportDesc) -> Result<(ImageId, bool)> {
        let mut internal = self.h_internal.lock().unwrap();

        if desc.modifier != DrmModifier::Invalid
            && !self.h_caps.contains(Capabilities::DMABUF_MODIFIERS)
        {
            return Err(SquallError::DMABUF_IMPORT_FAILED);
        }

        let external_only = internal.h_external_only.contains(&desc.fourcc);
        if !external_only
            && (!SIMPLE_DMABUF_FORMATS.contains(&desc.fourcc) || desc.planes.len() != 1)
        {
            return Err(SquallError::DMABUF_IMPORT_FAILED);
        }

        if let Some(budget) = internal.h_import_budget.as_mut() {
            if *budget == 0 {
                return Err(SquallError::DMABUF_IMPORT_FAILED);
            }
            *budget -= 1;
        }

        let id = internal.alloc_id();
        internal.h_images.insert(id);
        Ok((ImageId(id), external_only))
    }

    fn import_external(&self, handle: u64, _plane: usize) -> Result<ImageId> {
        if handle == 0 {
            return Err(SquallError::EXTERNAL_IMPORT_FAILED);
        }
        let mut internal = self.h_internal.lock().unwrap();
        let id = internal.alloc_id();
        internal.h_images.insert(id);
        Ok(ImageId(id))
    }

    fn destroy_image(&self, image: ImageId) {
        self.h_internal.lock().unwrap().h_images.remove(&image.0);
    }

    fn texture_from_image(&self, image: ImageId) -> Result<TextureId> {
        let mut internal = self.h_internal.lock().unwrap();
        if !internal.h_images.contains(&image.0) {
            return Err(SquallError::DEVICE_ERROR);
        }
        let id = internal.alloc_id();
        internal.h_textures.insert(
            id,
            TextureDesc {
                width: 1,
                height: 1,
                format: vk::Format::UNDEFINED,
            },
        );
        Ok(TextureId(id))
    }

    fn query_dmabuf_formats(&self) -> Option<Vec<DrmFourcc>> {
        self.h_internal.lock().unwrap().h_dmabuf_formats.clone()
    }

    fn query_dmabuf_modifiers(&self, _fourcc: DrmFourcc) -> Vec<DrmModifier> {
        match self.h_caps.contains(Capabilities::DMABUF_MODIFIERS) {
            true => vec![DrmModifier::Linear],
            false => Vec::new(),
        }
    }

    fn create_target(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        kind: TargetKind,
    ) -> Result<TargetId> {
        if !self.supports_render_format(format) || width == 0 || height == 0 {
            return Err(SquallError::DEVICE_ERROR);
        }

        let mut internal = self.h_internal.lock().unwrap();
        if let Some(budget) = internal.h_target_budget.as_mut() {
            if *budget == 0 {
                return Err(SquallError::OUT_OF_MEMORY);
            }
            *budget -= 1;
        }

        let id = internal.alloc_id();
        internal.h_targets.insert(
            id,
            HeadlessTarget {
                ht_width: width,
                ht_height: height,
                ht_kind: kind,
                ht_last_present: [None; SWAPCHAIN_LEN],
                ht_present_count: 0,
            },
        );
        Ok(TargetId(id))
    }

    fn destroy_target(&self, target: TargetId) {
        let mut internal = self.h_internal.lock().unwrap();
        internal.h_targets.remove(&target.0);
        if internal.h_current == Some(target) {
            internal.h_current = None;
        }
        if internal.h_bound == Some(target) {
            internal.h_bound = None;
        }
    }

    fn target_texture(&self, target: TargetId) -> Result<TextureId> {
        let mut internal = self.h_internal.lock().unwrap();
        let (width, height) = match internal.h_targets.get(&target.0) {
            Some(t) => (t.ht_width, t.ht_height),
            None => return Err(SquallError::DEVICE_ERROR),
        };
        let id = internal.alloc_id();
        internal.h_textures.insert(
            id,
            TextureDesc {
                width: width,
                height: height,
                format: vk::Format::UNDEFINED,
            },
        );
        Ok(TextureId(id))
    }

    fn make_current(&self, target: TargetId) -> Result<()> {
        let mut internal = self.h_internal.lock().unwrap();
        if internal.h_fail_make_current || !internal.h_targets.contains_key(&target.0) {
            return Err(SquallError::MAKE_CURRENT_FAILED);
        }
        internal.h_current = Some(target);
        internal.record(GpuCommand::MakeCurrent(target));
        Ok(())
    }

    fn bind_target(&self, target: TargetId, viewport: &Rect<i32>) {
        let mut internal = self.h_internal.lock().unwrap();
        internal.h_bound = Some(target);
        internal.record(GpuCommand::BindTarget(target, *viewport));
    }

    fn buffer_age(&self, target: TargetId) -> u32 {
        let internal = self.h_internal.lock().unwrap();
        let t = match internal.h_targets.get(&target.0) {
            Some(t) => t,
            None => return 0,
        };
        if t.ht_kind != TargetKind::Presentation {
            return 0;
        }

        match internal.h_forced_age {
            Some(age) => age,
            None => t.age(),
        }
    }

    fn set_damage_region(&self, target: TargetId, rects: &[vk::RectLayerKHR]) {
        self.h_internal
            .lock()
            .unwrap()
            .record(GpuCommand::SetDamageRegion(target, to_rects(rects)));
    }

    fn use_shader(&self, config: &ShaderConfig) -> Result<()> {
        let mut internal = self.h_internal.lock().unwrap();
        if internal.h_broken_variants.contains(&config.variant) {
            return Err(SquallError::SHADER_COMPILATION_FAILED);
        }
        internal.record(GpuCommand::UseShader(config.clone()));
        Ok(())
    }

    fn use_fallback_shader(&self) {
        self.h_internal
            .lock()
            .unwrap()
            .record(GpuCommand::UseFallbackShader);
    }

    fn set_blend(&self, enable: bool) {
        self.h_internal
            .lock()
            .unwrap()
            .record(GpuCommand::SetBlend(enable));
    }

    fn draw_triangle_fans(&self, vertices: &[Vertex], fan_lengths: &[u32]) {
        let mut internal = self.h_internal.lock().unwrap();
        let target = internal.h_bound;
        internal.record(GpuCommand::DrawFans {
            target: target,
            vertices: vertices.to_vec(),
            fans: fan_lengths.to_vec(),
        });
    }

    fn draw_lines(&self, vertices: &[Vertex], _color: [f32; 4]) {
        let mut internal = self.h_internal.lock().unwrap();
        let target = internal.h_bound;
        internal.record(GpuCommand::DrawLines {
            target: target,
            count: vertices.len(),
        });
    }

    fn create_fence(&self) -> Option<SyncFile> {
        if !self.h_caps.contains(Capabilities::NATIVE_FENCE) {
            return None;
        }

        let (rx, tx) = match nix::unistd::pipe() {
            Ok(p) => p,
            Err(e) => {
                log::error!("headless: could not create fence pipe: {:?}", e);
                return None;
            }
        };

        let mut internal = self.h_internal.lock().unwrap();
        internal.h_submitted += 1;
        let point = internal.h_submitted;
        internal.h_pending.push((point, tx));
        internal.record(GpuCommand::CreateFence(point));

        Some(SyncFile::new(rx, point))
    }

    fn wait_sync_file(&self, fence: &SyncFile) -> Result<()> {
        self.h_internal
            .lock()
            .unwrap()
            .record(GpuCommand::WaitSyncFile(fence.point()));
        Ok(())
    }

    fn sync_file_signaled(&self, fence: &SyncFile) -> bool {
        fence.poll_signaled()
    }

    fn write_timestamp(&self) -> Result<QueryId> {
        if !self.h_caps.contains(Capabilities::TIMER_QUERY) {
            return Err(SquallError::DEVICE_ERROR);
        }
        let mut internal = self.h_internal.lock().unwrap();
        let id = internal.alloc_id();
        // Resolved once the next fence signals
        let point = internal.h_submitted + 1;
        internal.h_queries.insert(id, point);
        internal.record(GpuCommand::WriteTimestamp(QueryId(id)));
        Ok(QueryId(id))
    }

    fn get_timestamp(&self, query: QueryId) -> Result<Option<u64>> {
        let internal = self.h_internal.lock().unwrap();
        let point = internal
            .h_queries
            .get(&query.0)
            .ok_or(SquallError::DEVICE_ERROR)?;

        if *point > internal.h_signaled {
            return Ok(None);
        }
        // A fake but monotonic clock, one microsecond per query
        Ok(Some(query.0 * 1000))
    }

    fn destroy_query(&self, query: QueryId) {
        self.h_internal.lock().unwrap().h_queries.remove(&query.0);
    }

    /// Every byte of a row is set to its row number on screen
    fn read_pixels(
        &self,
        target: TargetId,
        rect: &Rect<i32>,
        _format: vk::Format,
        stride: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let mut internal = self.h_internal.lock().unwrap();
        if internal.h_fail_read_pixels || !internal.h_targets.contains_key(&target.0) {
            return Err(SquallError::READ_PIXELS_FAILED);
        }

        let height = rect.r_size.1.max(0) as usize;
        let row_bytes = rect.r_size.0.max(0) as usize * 4;
        if (stride as usize) < row_bytes || out.len() < stride as usize * height {
            return Err(SquallError::READ_PIXELS_FAILED);
        }

        let reverse = self.h_caps.contains(Capabilities::PACK_REVERSE_ROW_ORDER);
        for i in 0..height {
            let screen_row = match reverse {
                true => i,
                false => height - 1 - i,
            };
            let start = i * stride as usize;
            out[start..start + row_bytes].fill((rect.r_pos.1 as usize + screen_row) as u8);
        }

        internal.record(GpuCommand::ReadPixels(target, *rect));
        Ok(())
    }

    fn export_target(&self, target: TargetId) -> Result<(OwnedFd, u32)> {
        let internal = self.h_internal.lock().unwrap();
        if internal.h_fail_export {
            return Err(SquallError::DEVICE_ERROR);
        }
        let t = internal
            .h_targets
            .get(&target.0)
            .ok_or(SquallError::DEVICE_ERROR)?;

        let (rx, _tx) = nix::unistd::pipe().map_err(|_| SquallError::INVALID_FD)?;
        Ok((rx, t.ht_width * 4))
    }

    fn present(&self, target: TargetId, damage: Option<&[vk::RectLayerKHR]>) -> Result<()> {
        let mut internal = self.h_internal.lock().unwrap();
        if internal.h_current != Some(target) {
            return Err(SquallError::PRESENT_FAILED);
        }

        let t = internal
            .h_targets
            .get_mut(&target.0)
            .ok_or(SquallError::PRESENT_FAILED)?;
        if t.ht_kind != TargetKind::Presentation {
            return Err(SquallError::PRESENT_FAILED);
        }
        let back = t.back_buffer();
        t.ht_present_count += 1;
        t.ht_last_present[back] = Some(t.ht_present_count);

        internal.record(GpuCommand::Present {
            target: target,
            damage: damage.map(to_rects),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_age_follows_swapchain() {
        let dev = HeadlessDevice::new(Capabilities::all());
        let t = dev
            .create_target(32, 32, vk::Format::B8G8R8A8_UNORM, TargetKind::Presentation)
            .unwrap();
        dev.make_current(t).unwrap();

        assert_eq!(dev.buffer_age(t), 0);
        dev.present(t, None).unwrap();
        assert_eq!(dev.buffer_age(t), 0);
        dev.present(t, None).unwrap();
        assert_eq!(dev.buffer_age(t), 2);
        dev.present(t, None).unwrap();
        assert_eq!(dev.buffer_age(t), 2);

        dev.force_buffer_age(Some(1));
        assert_eq!(dev.buffer_age(t), 1);
    }

    #[test]
    fn fences_signal_in_order() {
        let dev = HeadlessDevice::new(Capabilities::NATIVE_FENCE);
        let a = dev.create_fence().unwrap();
        let b = dev.create_fence().unwrap();
        assert!(a.point() < b.point());

        dev.signal_to(a.point());
        assert!(dev.sync_file_signaled(&a));
        assert!(!dev.sync_file_signaled(&b));

        dev.signal_all();
        assert!(dev.sync_file_signaled(&b));
    }

    #[test]
    fn no_fences_without_native_fence() {
        let dev = HeadlessDevice::new(Capabilities::empty());
        assert!(dev.create_fence().is_none());
    }

    #[test]
    fn read_pixels_bottom_up() {
        let dev = HeadlessDevice::new(Capabilities::empty());
        let t = dev
            .create_target(4, 3, vk::Format::B8G8R8A8_UNORM, TargetKind::Offscreen)
            .unwrap();
        let mut out = vec![0u8; 16 * 3];
        dev.read_pixels(
            t,
            &Rect::new(0, 0, 4, 3),
            vk::Format::B8G8R8A8_UNORM,
            16,
            out.as_mut_slice(),
        )
        .unwrap();
        assert_eq!(out[0], 2);
        assert_eq!(out[32], 0);
    }
}
