// Output state
//
// Every output has a presentation target, an optional shadow target
// and four border textures. The damage of the last few frames is
// kept so back buffers of any age can be brought up to date.
//
// Austin Shafer - 2020
use ash::vk;
use bitflags::bitflags;
use drm_fourcc::DrmFourcc;

use crate::caps::Capabilities;
use crate::format::render_format;
use crate::gpu::{GpuDevice, GpuTexture, RenderTarget, TargetKind, TextureDesc, TextureUpload};
use crate::capture::CaptureQueue;
use crate::{Result, SquallError};
use utils::log;
use utils::region::{Rect, Region};

use std::collections::VecDeque;
use std::sync::Arc;

/// Number of frames of damage history kept per output
pub const BUFFER_DAMAGE_COUNT: usize = 2;

bitflags! {
    /// Which parts of the border decoration need redrawing
    #[derive(Default)]
    pub struct BorderStatus: u32 {
        const TOP = 1 << 0;
        const LEFT = 1 << 1;
        const RIGHT = 1 << 2;
        const BOTTOM = 1 << 3;
        const ALL_DIRTY = Self::TOP.bits | Self::LEFT.bits | Self::RIGHT.bits | Self::BOTTOM.bits;
        /// A border changed shape, the whole output must be repainted
        const SIZE_CHANGED = 1 << 4;
    }
}

impl BorderStatus {
    pub const CLEAN: BorderStatus = BorderStatus::empty();
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BorderSide {
    Top,
    Left,
    Right,
    Bottom,
}

impl BorderSide {
    pub const ALL: [BorderSide; 4] = [
        BorderSide::Top,
        BorderSide::Left,
        BorderSide::Right,
        BorderSide::Bottom,
    ];

    pub fn flag(&self) -> BorderStatus {
        match self {
            BorderSide::Top => BorderStatus::TOP,
            BorderSide::Left => BorderStatus::LEFT,
            BorderSide::Right => BorderStatus::RIGHT,
            BorderSide::Bottom => BorderStatus::BOTTOM,
        }
    }

    fn index(&self) -> usize {
        match self {
            BorderSide::Top => 0,
            BorderSide::Left => 1,
            BorderSide::Right => 2,
            BorderSide::Bottom => 3,
        }
    }
}

/// Parameters for creating an output
#[derive(Debug, Clone)]
pub struct OutputOptions {
    /// Framebuffer size, including borders
    pub fb_size: (i32, i32),
    /// The composited area inside the framebuffer
    pub area: Rect<i32>,
    /// Global position of the composited area
    pub position: (i32, i32),
    /// Acceptable render formats in order of preference
    pub formats: Vec<DrmFourcc>,
    /// Composite into a high precision shadow buffer first
    pub needs_shadow: bool,
}

impl OutputOptions {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            fb_size: (width, height),
            area: Rect::new(0, 0, width, height),
            position: (0, 0),
            formats: vec![DrmFourcc::Xrgb8888, DrmFourcc::Argb8888],
            needs_shadow: false,
        }
    }

    pub fn with_area(mut self, fb_size: (i32, i32), area: Rect<i32>) -> Self {
        self.fb_size = fb_size;
        self.area = area;
        self
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.position = (x, y);
        self
    }

    pub fn with_formats(mut self, formats: Vec<DrmFourcc>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_shadow(mut self, enable: bool) -> Self {
        self.needs_shadow = enable;
        self
    }
}

/// One frame of damage history
#[derive(Debug, Clone)]
struct DamageRecord {
    dr_damage: Region,
    dr_border: BorderStatus,
}

/// A border decoration texture
#[derive(Debug, Default)]
pub(crate) struct OutputBorder {
    pub ob_width: i32,
    pub ob_height: i32,
    pub ob_texture: Option<GpuTexture>,
}

/// The high precision target surfaces are composited into before the
/// final color transform
#[derive(Debug)]
pub(crate) struct ShadowTarget {
    pub st_target: RenderTarget,
    pub st_texture: GpuTexture,
    /// Nothing has been drawn into it yet
    pub st_fresh: bool,
}

impl ShadowTarget {
    fn new(dev: &Arc<dyn GpuDevice>, caps: Capabilities, area: &Rect<i32>) -> Result<Self> {
        if !caps.contains(Capabilities::TEXTURE_16BIT)
            || !dev.supports_render_format(vk::Format::R16G16B16A16_SFLOAT)
        {
            log::error!("Shadow buffers need 16 bit float render targets");
            return Err(SquallError::SHADOW_UNSUPPORTED);
        }

        let target = RenderTarget::new(
            dev,
            area.r_size.0 as u32,
            area.r_size.1 as u32,
            vk::Format::R16G16B16A16_SFLOAT,
            TargetKind::Offscreen,
        )
        .map_err(|_| SquallError::OUTPUT_CREATION_FAILED)?;
        let texture = GpuTexture::from_target(dev, &target)
            .map_err(|_| SquallError::OUTPUT_CREATION_FAILED)?;

        Ok(Self {
            st_target: target,
            st_texture: texture,
            st_fresh: true,
        })
    }
}

/// Renderer state for one output
pub struct OutputState {
    os_id: u64,
    os_fb_size: (i32, i32),
    os_area: Rect<i32>,
    os_position: (i32, i32),
    os_format: DrmFourcc,
    os_vk_format: vk::Format,
    os_kind: TargetKind,
    /// Presentation outputs have one target, virtual outputs one per
    /// buffer they cycle through
    os_targets: Vec<RenderTarget>,
    os_current: usize,
    pub(crate) os_shadow: Option<ShadowTarget>,
    /// Most recent frame first
    os_damage_ring: VecDeque<DamageRecord>,
    pub(crate) os_borders: [OutputBorder; 4],
    pub(crate) os_border_status: BorderStatus,
    /// The fan debug toggle this output last repainted for
    pub(crate) os_fan_debug_serial: u64,
    pub(crate) os_capture: Option<Box<dyn CaptureQueue>>,
}

fn check_compositing_area(fb_size: (i32, i32), area: &Rect<i32>) -> Result<()> {
    let fb = Rect::new(0, 0, fb_size.0, fb_size.1);
    if area.is_empty() || !fb.contains_rect(area) {
        log::error!("Output area {:?} does not fit in {:?}", area, fb_size);
        return Err(SquallError::OUTPUT_CREATION_FAILED);
    }
    Ok(())
}

fn create_targets(
    dev: &Arc<dyn GpuDevice>,
    fb_size: (i32, i32),
    format: vk::Format,
    kind: TargetKind,
    count: usize,
) -> Result<Vec<RenderTarget>> {
    let mut ret = Vec::with_capacity(count);
    for _ in 0..count {
        ret.push(
            RenderTarget::new(dev, fb_size.0 as u32, fb_size.1 as u32, format, kind)
                .map_err(|_| SquallError::OUTPUT_CREATION_FAILED)?,
        );
    }
    Ok(ret)
}

impl OutputState {
    /// Create an output
    ///
    /// Either everything is allocated or nothing is.
    pub(crate) fn new(
        dev: &Arc<dyn GpuDevice>,
        caps: Capabilities,
        id: u64,
        opts: &OutputOptions,
        kind: TargetKind,
        target_count: usize,
    ) -> Result<Self> {
        check_compositing_area(opts.fb_size, &opts.area)?;

        let (fourcc, vk_format) = opts
            .formats
            .iter()
            .find_map(|f| match render_format(*f) {
                Some((vkf, req)) if caps.contains(req) && dev.supports_render_format(vkf) => {
                    Some((*f, vkf))
                }
                _ => None,
            })
            .ok_or_else(|| {
                log::error!("None of {:?} can be rendered to", opts.formats);
                SquallError::NO_SUITABLE_FORMAT
            })?;

        let targets = create_targets(dev, opts.fb_size, vk_format, kind, target_count)?;
        let shadow = match opts.needs_shadow {
            true => Some(ShadowTarget::new(dev, caps, &opts.area)?),
            false => None,
        };

        log::debug!(
            "Created output {} ({:?}, {}x{}, shadow: {})",
            id,
            fourcc,
            opts.fb_size.0,
            opts.fb_size.1,
            shadow.is_some()
        );

        Ok(Self {
            os_id: id,
            os_fb_size: opts.fb_size,
            os_area: opts.area,
            os_position: opts.position,
            os_format: fourcc,
            os_vk_format: vk_format,
            os_kind: kind,
            os_targets: targets,
            os_current: 0,
            os_shadow: shadow,
            os_damage_ring: VecDeque::with_capacity(BUFFER_DAMAGE_COUNT),
            os_borders: Default::default(),
            os_border_status: BorderStatus::CLEAN,
            os_fan_debug_serial: 0,
            os_capture: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.os_id
    }

    pub fn fb_size(&self) -> (i32, i32) {
        self.os_fb_size
    }

    pub fn area(&self) -> Rect<i32> {
        self.os_area
    }

    pub fn position(&self) -> (i32, i32) {
        self.os_position
    }

    pub fn set_position(&mut self, x: i32, y: i32) {
        self.os_position = (x, y);
    }

    pub fn format(&self) -> DrmFourcc {
        self.os_format
    }

    pub(crate) fn vk_format(&self) -> vk::Format {
        self.os_vk_format
    }

    pub fn border_status(&self) -> BorderStatus {
        self.os_border_status
    }

    pub fn has_shadow(&self) -> bool {
        self.os_shadow.is_some()
    }

    pub fn set_capture_queue(&mut self, queue: Box<dyn CaptureQueue>) {
        self.os_capture = Some(queue);
    }

    pub(crate) fn target(&self) -> &RenderTarget {
        &self.os_targets[self.os_current]
    }

    pub(crate) fn target_count(&self) -> usize {
        self.os_targets.len()
    }

    pub(crate) fn set_current_target(&mut self, index: usize) {
        self.os_current = index.min(self.os_targets.len() - 1);
    }

    /// The composited area in global coordinates
    pub fn global_rect(&self) -> Rect<i32> {
        Rect::new(
            self.os_position.0,
            self.os_position.1,
            self.os_area.r_size.0,
            self.os_area.r_size.1,
        )
    }

    /// Translation from global coordinates to framebuffer pixels
    pub(crate) fn fb_offset(&self) -> (i32, i32) {
        (
            self.os_area.r_pos.0 - self.os_position.0,
            self.os_area.r_pos.1 - self.os_position.1,
        )
    }

    /// Damage that has to be repainted into a back buffer of this age
    ///
    /// Returns the damage in global coordinates and the border sides
    /// that are stale. Unknown ages and ages beyond our history get
    /// everything.
    pub fn get_damage(&self, age: u32) -> (Region, BorderStatus) {
        let full = Region::from_rect(self.global_rect());
        let age = age as usize;

        if age == 0 || age - 1 > BUFFER_DAMAGE_COUNT || age - 1 > self.os_damage_ring.len() {
            return (full, BorderStatus::ALL_DIRTY);
        }

        let mut damage = Region::new();
        let mut border = BorderStatus::CLEAN;
        for record in self.os_damage_ring.iter().take(age - 1) {
            border |= record.dr_border;
            damage.union(&record.dr_damage);
        }

        if border.contains(BorderStatus::SIZE_CHANGED) {
            return (full, BorderStatus::ALL_DIRTY | border);
        }
        (damage, border)
    }

    /// Remember this frame's damage for future back buffers
    pub fn rotate_damage(&mut self, damage: &Region, border: BorderStatus) {
        if self.os_damage_ring.len() == BUFFER_DAMAGE_COUNT {
            self.os_damage_ring.pop_back();
        }
        self.os_damage_ring.push_front(DamageRecord {
            dr_damage: damage.clone(),
            dr_border: border,
        });
    }

    /// Change the framebuffer size and composited area
    ///
    /// Targets are reallocated before anything is changed, so a failed
    /// resize leaves the output as it was.
    pub(crate) fn resize(
        &mut self,
        dev: &Arc<dyn GpuDevice>,
        caps: Capabilities,
        fb_size: (i32, i32),
        area: Rect<i32>,
    ) -> Result<()> {
        check_compositing_area(fb_size, &area)?;

        let targets = match fb_size == self.os_fb_size {
            true => None,
            false => Some(create_targets(
                dev,
                fb_size,
                self.os_vk_format,
                self.os_kind,
                self.os_targets.len(),
            )?),
        };
        let shadow = match self.os_shadow.is_some() && area.r_size != self.os_area.r_size {
            true => Some(ShadowTarget::new(dev, caps, &area)?),
            false => None,
        };

        if let Some(targets) = targets {
            self.os_targets = targets;
            self.os_current = 0;
        }
        if shadow.is_some() {
            self.os_shadow = shadow;
        }

        log::debug!(
            "Resized output {} to {:?}, area {:?}",
            self.os_id,
            fb_size,
            area
        );
        self.os_fb_size = fb_size;
        self.os_area = area;
        self.os_border_status |= BorderStatus::SIZE_CHANGED | BorderStatus::ALL_DIRTY;
        Ok(())
    }

    /// Replace one of the border textures
    ///
    /// `data` is ARGB8888 with a stride of `width * 4`. A border with no
    /// data is removed.
    pub(crate) fn set_border(
        &mut self,
        dev: &Arc<dyn GpuDevice>,
        side: BorderSide,
        width: i32,
        height: i32,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let texture = match data {
            Some(data) if width > 0 && height > 0 => {
                let tex = GpuTexture::new(
                    dev,
                    &TextureDesc {
                        width: width as u32,
                        height: height as u32,
                        format: vk::Format::B8G8R8A8_UNORM,
                    },
                )?;
                tex.upload(&TextureUpload {
                    rect: Rect::new(0, 0, width, height),
                    row_length: width as u32,
                    texel_size: 4,
                    data: data,
                })?;
                Some(tex)
            }
            _ => None,
        };

        let border = &mut self.os_borders[side.index()];
        // A new border size invalidates the whole framebuffer
        if border.ob_width != width || border.ob_height != height {
            self.os_border_status |= BorderStatus::SIZE_CHANGED | BorderStatus::ALL_DIRTY;
        }
        border.ob_width = width;
        border.ob_height = height;
        border.ob_texture = texture;
        self.os_border_status |= side.flag();
        Ok(())
    }

    pub(crate) fn border(&self, side: BorderSide) -> &OutputBorder {
        &self.os_borders[side.index()]
    }

    /// Where a border side is drawn, in framebuffer pixels
    pub(crate) fn border_rect(&self, side: BorderSide) -> Rect<i32> {
        let (fb_w, fb_h) = self.os_fb_size;
        let top = self.border(BorderSide::Top).ob_height;
        let bottom = self.border(BorderSide::Bottom).ob_height;
        let middle = (fb_h - top - bottom).max(0);

        match side {
            BorderSide::Top => Rect::new(0, 0, fb_w, top),
            BorderSide::Left => Rect::new(0, top, self.border(side).ob_width, middle),
            BorderSide::Right => {
                let w = self.border(side).ob_width;
                Rect::new(fb_w - w, top, w, middle)
            }
            BorderSide::Bottom => Rect::new(0, fb_h - bottom, fb_w, bottom),
        }
    }

    /// Framebuffer damage covering the dirty borders
    pub(crate) fn border_damage(&self, status: BorderStatus) -> Region {
        let mut ret = Region::new();
        for side in BorderSide::ALL.iter() {
            if status.contains(side.flag()) && self.border(*side).ob_texture.is_some() {
                ret.add_rect(&self.border_rect(*side));
            }
        }
        ret
    }

    /// Convert global damage to rects the presentation engine
    /// understands
    ///
    /// The result is in framebuffer pixels with a top left origin.
    pub(crate) fn to_present_rects(&self, global: &Region, fb_extra: &Region) -> Vec<vk::RectLayerKHR> {
        let (dx, dy) = self.fb_offset();
        let mut fb = global.clone();
        fb.translate(dx, dy);
        fb.union(fb_extra);
        fb.intersect_rect(&Rect::new(0, 0, self.os_fb_size.0, self.os_fb_size.1));

        fb.rects()
            .iter()
            .map(|r| vk::RectLayerKHR {
                offset: vk::Offset2D {
                    x: r.r_pos.0,
                    y: r.r_pos.1,
                },
                extent: vk::Extent2D {
                    width: r.r_size.0 as u32,
                    height: r.r_size.1 as u32,
                },
                layer: 0,
            })
            .collect()
    }
}

impl std::fmt::Debug for OutputState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputState")
            .field("id", &self.os_id)
            .field("fb_size", &self.os_fb_size)
            .field("area", &self.os_area)
            .field("format", &self.os_format)
            .field("border_status", &self.os_border_status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn output(dev: &Arc<dyn GpuDevice>) -> OutputState {
        OutputState::new(
            dev,
            Capabilities::all(),
            1,
            &OutputOptions::new(100, 100),
            TargetKind::Presentation,
            1,
        )
        .unwrap()
    }

    fn dev() -> Arc<dyn GpuDevice> {
        Arc::new(HeadlessDevice::new(Capabilities::all()))
    }

    #[test]
    fn unknown_age_is_full_damage() {
        let dev = dev();
        let mut out = output(&dev);
        out.rotate_damage(&Region::from_rect(Rect::new(0, 0, 5, 5)), BorderStatus::CLEAN);
        out.rotate_damage(&Region::from_rect(Rect::new(5, 5, 5, 5)), BorderStatus::CLEAN);

        let full = Region::from_rect(Rect::new(0, 0, 100, 100));
        assert_eq!(out.get_damage(0), (full.clone(), BorderStatus::ALL_DIRTY));
        assert_eq!(out.get_damage(4), (full, BorderStatus::ALL_DIRTY));
    }

    #[test]
    fn age_replays_history() {
        let dev = dev();
        let mut out = output(&dev);
        let a = Region::from_rect(Rect::new(0, 0, 5, 5));
        let b = Region::from_rect(Rect::new(50, 50, 5, 5));
        out.rotate_damage(&a, BorderStatus::CLEAN);
        out.rotate_damage(&b, BorderStatus::TOP);

        assert_eq!(out.get_damage(1), (Region::new(), BorderStatus::CLEAN));
        assert_eq!(out.get_damage(2), (b.clone(), BorderStatus::TOP));

        let mut both = a.clone();
        both.union(&b);
        assert_eq!(out.get_damage(3), (both, BorderStatus::TOP));
    }

    #[test]
    fn ring_only_keeps_recent_frames() {
        let dev = dev();
        let mut out = output(&dev);
        for i in 0..5 {
            out.rotate_damage(&Region::from_rect(Rect::new(i, 0, 1, 1)), BorderStatus::CLEAN);
        }
        let (damage, _) = out.get_damage(3);
        assert_eq!(damage, Region::from_rect(Rect::new(3, 0, 2, 1)));
    }

    #[test]
    fn size_change_in_history_is_full_damage() {
        let dev = dev();
        let mut out = output(&dev);
        out.rotate_damage(&Region::new(), BorderStatus::SIZE_CHANGED);
        out.rotate_damage(&Region::new(), BorderStatus::CLEAN);

        let (damage, border) = out.get_damage(3);
        assert_eq!(damage.area(), 100 * 100);
        assert!(border.contains(BorderStatus::ALL_DIRTY));
    }

    #[test]
    fn resize_marks_size_changed() {
        let dev = dev();
        let mut out = output(&dev);
        let old_target = out.target().id();
        out.resize(&dev, Capabilities::all(), (200, 100), Rect::new(0, 0, 200, 100))
            .unwrap();

        assert!(out.border_status().contains(BorderStatus::SIZE_CHANGED));
        assert_ne!(out.target().id(), old_target);
        assert_eq!(out.global_rect(), Rect::new(0, 0, 200, 100));
    }

    #[test]
    fn bad_area_is_rejected() {
        let dev = dev();
        let opts = OutputOptions::new(100, 100).with_area((100, 100), Rect::new(50, 50, 100, 100));
        assert_eq!(
            OutputState::new(&dev, Capabilities::all(), 1, &opts, TargetKind::Presentation, 1).err(),
            Some(SquallError::OUTPUT_CREATION_FAILED)
        );
    }

    #[test]
    fn borders_and_present_rects() {
        let dev = dev();
        let opts = OutputOptions::new(100, 100).with_area((100, 110), Rect::new(0, 10, 100, 100));
        let mut out =
            OutputState::new(&dev, Capabilities::all(), 1, &opts, TargetKind::Presentation, 1)
                .unwrap();
        let data = vec![0u8; 100 * 10 * 4];
        out.set_border(&dev, BorderSide::Top, 100, 10, Some(&data))
            .unwrap();
        assert!(out
            .border_status()
            .contains(BorderStatus::TOP | BorderStatus::SIZE_CHANGED));
        assert_eq!(out.border_rect(BorderSide::Top), Rect::new(0, 0, 100, 10));

        // Global 30,0 is framebuffer 30,10
        let rects = out.to_present_rects(
            &Region::from_rect(Rect::new(30, 0, 10, 10)),
            &Region::new(),
        );
        assert_eq!(rects.len(), 1);
        assert_eq!(rects[0].offset.x, 30);
        assert_eq!(rects[0].offset.y, 10);
        assert_eq!(rects[0].extent.height, 10);
    }

    #[test]
    fn tall_borders_leave_no_middle() {
        let dev = dev();
        let opts = OutputOptions::new(100, 100).with_area((100, 40), Rect::new(0, 10, 100, 20));
        let mut out =
            OutputState::new(&dev, Capabilities::all(), 1, &opts, TargetKind::Presentation, 1)
                .unwrap();
        let data = vec![0u8; 100 * 25 * 4];
        out.set_border(&dev, BorderSide::Top, 100, 25, Some(&data))
            .unwrap();
        out.set_border(&dev, BorderSide::Bottom, 100, 25, Some(&data))
            .unwrap();
        out.set_border(&dev, BorderSide::Left, 10, 1, Some(&data[..40]))
            .unwrap();

        let left = out.border_rect(BorderSide::Left);
        assert_eq!(left.r_size.1, 0);
        assert!(left.is_empty());
    }
}
