// The toplevel renderer
//
// This owns everything shared between outputs: the device handle, the
// state of every surface, the dmabuf format cache and the scratch space
// used to build geometry. Outputs are owned by the caller and passed in
// for every operation on them.
//
// Austin Shafer - 2020
use crate::buffer::{BufferKind, BufferRegistry, ClientBuffer};
use crate::caps::Capabilities;
use crate::config::CreateInfo;
use crate::dmabuf::DmabufFormatCache;
use crate::geometry::{FanBuffer, View};
use crate::gpu::{GpuDevice, TargetKind};
use crate::output::{BorderSide, OutputOptions, OutputState};
use crate::repaint::{self, RepaintContext, RepaintParams};
use crate::surface::{self, AttachContext, SurfaceId, SurfaceState};
use crate::sync::SyncFile;
use crate::timeline::{self, RenderPoint, TimelinePoint, TimelineRecord, TimelineSink};
use crate::virtual_output::{FrameStatus, SubmitFn, VirtualOutput, VIRTUAL_BUFFER_COUNT};
use crate::{Result, SquallError};
use drm_fourcc::{DrmFourcc, DrmModifier};
use utils::log;
use utils::region::{Rect, Region};
use utils::timing::MonotonicClock;

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

/// The operations the compositor core drives a renderer with
pub trait RendererInterface {
    fn output_create(&mut self, opts: &OutputOptions) -> Result<OutputState>;
    fn output_destroy(&mut self, output: OutputState);
    fn output_resize(
        &mut self,
        output: &mut OutputState,
        fb_size: (i32, i32),
        area: Rect<i32>,
    ) -> Result<()>;
    fn output_set_border(
        &mut self,
        output: &mut OutputState,
        side: BorderSide,
        width: i32,
        height: i32,
        data: Option<&[u8]>,
    ) -> Result<()>;
    fn repaint_output(
        &mut self,
        output: &mut OutputState,
        views: &[View],
        damage: &Region,
    ) -> Result<()>;
    fn attach(
        &mut self,
        surface: SurfaceId,
        buffer: Option<&ClientBuffer>,
        acquire: Option<SyncFile>,
    ) -> Result<Option<SyncFile>>;
    fn flush_damage(&mut self, surface: SurfaceId, damage: &Region);
    fn import_dmabuf(&mut self, buffer: &ClientBuffer) -> Result<()>;
    fn query_dmabuf_formats(&mut self) -> Vec<DrmFourcc>;
    fn query_dmabuf_modifiers(&mut self, format: DrmFourcc) -> Vec<DrmModifier>;
    fn buffer_destroyed(&mut self, buffer: &ClientBuffer);
    fn surface_destroyed(&mut self, surface: SurfaceId);
}

/// The squall renderer
pub struct Renderer {
    r_dev: Arc<dyn GpuDevice>,
    /// Device capabilities, less whatever the config disabled
    r_caps: Capabilities,
    r_info: CreateInfo,
    r_formats: DmabufFormatCache,
    /// Scratch geometry shared by every draw
    r_fans: FanBuffer,
    r_registry: BufferRegistry,
    r_surfaces: HashMap<SurfaceId, SurfaceState>,
    r_timeline: Option<Box<dyn TimelineSink>>,
    /// Frames waiting on their fence before their timestamps are read
    r_render_points: Vec<RenderPoint>,
    r_clock: MonotonicClock,
    r_fan_debug: bool,
    /// Bumped every time fan debug is toggled
    r_fan_debug_serial: u64,
    r_next_output_id: u64,
    r_destroyed: bool,
}

impl Renderer {
    pub fn new(dev: Arc<dyn GpuDevice>, info: &CreateInfo) -> Result<Renderer> {
        let mut caps = dev.capabilities();
        if info.disable_buffer_age {
            caps.remove(Capabilities::BUFFER_AGE);
        }
        if info.disable_partial_update {
            caps.remove(Capabilities::PARTIAL_UPDATE);
        }
        caps.log_missing();

        let granted = dev.set_context_priority(info.context_priority);
        if granted != info.context_priority {
            log::info!(
                "Requested {:?} context priority, got {:?}",
                info.context_priority,
                granted
            );
        }

        log::debug!("Created renderer with {:?}", caps);
        Ok(Renderer {
            r_dev: dev,
            r_caps: caps,
            r_info: info.clone(),
            r_formats: DmabufFormatCache::new(),
            r_fans: FanBuffer::new(),
            r_registry: BufferRegistry::new(),
            r_surfaces: HashMap::new(),
            r_timeline: None,
            r_render_points: Vec::new(),
            r_clock: MonotonicClock::new(),
            r_fan_debug: info.fan_debug,
            r_fan_debug_serial: 0,
            r_next_output_id: 0,
            r_destroyed: false,
        })
    }

    fn check_alive(&self) -> Result<()> {
        match self.r_destroyed {
            true => Err(SquallError::RENDERER_DESTROYED),
            false => Ok(()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.r_caps
    }

    /// Report timeline events to `sink`
    ///
    /// GPU timestamps are only recorded while a sink is set.
    pub fn set_timeline(&mut self, sink: Option<Box<dyn TimelineSink>>) {
        self.r_timeline = sink;
    }

    /// Fences of the frames whose timestamps are still pending
    ///
    /// The compositor polls these and calls `process_render_points` once
    /// one becomes readable.
    pub fn render_fences(&self) -> Vec<BorrowedFd<'_>> {
        self.r_render_points.iter().map(|p| p.fence().as_fd()).collect()
    }

    /// Report the timestamps of every finished frame
    ///
    /// Never blocks, unfinished frames are kept for a later call.
    pub fn process_render_points(&mut self) {
        match self.r_timeline.as_mut() {
            Some(sink) => timeline::process_render_points(
                &mut self.r_render_points,
                self.r_clock.now_nsec(),
                &mut **sink,
            ),
            // Nobody is listening anymore
            None => self.r_render_points.clear(),
        }
    }

    /// Toggle outlining of every triangle fan drawn
    ///
    /// Every output is fully repainted on its next frame.
    pub fn set_fan_debug(&mut self, enable: bool) {
        log::info!("Fan debug {}", if enable { "enabled" } else { "disabled" });
        self.r_fan_debug = enable;
        self.r_fan_debug_serial += 1;
    }

    pub fn fan_debug(&self) -> bool {
        self.r_fan_debug
    }

    pub fn surface_state(&self, surface: SurfaceId) -> Option<&SurfaceState> {
        self.r_surfaces.get(&surface)
    }

    /// Take the release fence of the buffer last drawn for this surface
    pub fn take_release_fence(&mut self, surface: SurfaceId) -> Option<SyncFile> {
        self.r_surfaces
            .get_mut(&surface)
            .and_then(|s| s.release_slot().take())
    }

    fn create_output_state(
        &mut self,
        opts: &OutputOptions,
        kind: TargetKind,
        count: usize,
    ) -> Result<OutputState> {
        self.check_alive()?;
        self.r_next_output_id += 1;

        let mut output = OutputState::new(
            &self.r_dev,
            self.r_caps,
            self.r_next_output_id,
            opts,
            kind,
            count,
        )?;
        output.os_fan_debug_serial = self.r_fan_debug_serial;
        Ok(output)
    }

    /// Create an output drawing to a presentation target
    pub fn output_create(&mut self, opts: &OutputOptions) -> Result<OutputState> {
        self.create_output_state(opts, TargetKind::Presentation, 1)
    }

    pub fn output_destroy(&mut self, output: OutputState) {
        log::debug!("Destroying output {}", output.id());
        drop(output);
    }

    pub fn output_resize(
        &mut self,
        output: &mut OutputState,
        fb_size: (i32, i32),
        area: Rect<i32>,
    ) -> Result<()> {
        self.check_alive()?;
        output.resize(&self.r_dev, self.r_caps, fb_size, area)
    }

    /// Set one of the decoration borders, ARGB8888 pixels
    pub fn output_set_border(
        &mut self,
        output: &mut OutputState,
        side: BorderSide,
        width: i32,
        height: i32,
        data: Option<&[u8]>,
    ) -> Result<()> {
        self.check_alive()?;
        output.set_border(&self.r_dev, side, width, height, data)
    }

    fn repaint_internal(
        &mut self,
        output: &mut OutputState,
        views: &[View],
        damage: &Region,
        params: RepaintParams,
    ) -> Result<Option<SyncFile>> {
        self.check_alive()?;
        self.process_render_points();

        let mut ctx = RepaintContext {
            dev: &self.r_dev,
            caps: self.r_caps,
            info: &self.r_info,
            surfaces: &mut self.r_surfaces,
            fans: &mut self.r_fans,
            fan_debug: self.r_fan_debug,
            fan_debug_serial: self.r_fan_debug_serial,
            timing: self.r_timeline.is_some(),
            render_points: &mut self.r_render_points,
        };
        repaint::repaint_output(&mut ctx, output, views, damage, &params)
    }

    /// Draw and present a frame
    ///
    /// `views` are ordered front to back, `damage` is in global
    /// coordinates.
    pub fn repaint_output(
        &mut self,
        output: &mut OutputState,
        views: &[View],
        damage: &Region,
    ) -> Result<()> {
        self.repaint_internal(
            output,
            views,
            damage,
            RepaintParams {
                age: None,
                present: true,
            },
        )
        .map(|_| ())
    }

    /// Create an output which renders offscreen and hands every frame
    /// to `submit`
    pub fn virtual_output_create(
        &mut self,
        opts: &OutputOptions,
        submit: SubmitFn,
    ) -> Result<VirtualOutput> {
        let output = self.create_output_state(opts, TargetKind::Offscreen, VIRTUAL_BUFFER_COUNT)?;
        Ok(VirtualOutput::new(output, submit))
    }

    /// Draw a frame of a virtual output and submit it
    ///
    /// The frame is skipped if the consumer still holds every target.
    pub fn virtual_output_repaint(
        &mut self,
        vo: &mut VirtualOutput,
        views: &[View],
        damage: &Region,
    ) -> Result<FrameStatus> {
        self.check_alive()?;
        let (slot, age) = match vo.begin_frame() {
            Ok(s) => s,
            Err(e) => {
                log::debug!("Virtual output {}: {}, skipping frame", vo.output().id(), e);
                return Ok(FrameStatus::Skipped);
            }
        };

        self.repaint_internal(
            &mut vo.vo_output,
            views,
            damage,
            RepaintParams {
                age: Some(age),
                present: false,
            },
        )?;
        vo.submit_frame(&*self.r_dev, slot)
    }

    /// Bind a buffer to a surface, or detach with None
    ///
    /// Returns the release fence of the previously attached buffer if
    /// it hasn't been taken yet. A failure here is a client error, the
    /// client has already been told.
    pub fn attach(
        &mut self,
        surface: SurfaceId,
        buffer: Option<&ClientBuffer>,
        acquire: Option<SyncFile>,
    ) -> Result<Option<SyncFile>> {
        self.check_alive()?;
        let state = self
            .r_surfaces
            .entry(surface)
            .or_insert_with(|| SurfaceState::new(surface));

        let mut ctx = AttachContext {
            dev: &self.r_dev,
            caps: self.r_caps,
            registry: &mut self.r_registry,
        };
        let ret = state.attach(&mut ctx, buffer)?;

        let acquire = match acquire {
            Some(_) if buffer.is_none() => None,
            Some(_) if !self.r_caps.contains(Capabilities::NATIVE_FENCE) => {
                log::error!(
                    "Acquire fence for {:?} dropped, the device has no native fences",
                    surface
                );
                None
            }
            other => other,
        };
        state.set_acquire_fence(acquire);

        Ok(ret)
    }

    /// Hand over the damage of a commit, in buffer pixels
    pub fn flush_damage(&mut self, surface: SurfaceId, damage: &Region) {
        let state = match self.r_surfaces.get_mut(&surface) {
            Some(s) => s,
            None => return,
        };
        state.flush_damage(damage);
        self.process_render_points();

        if let Some(sink) = self.r_timeline.as_mut() {
            sink.record(&TimelineRecord {
                point: TimelinePoint::CoreFlushDamage,
                output: None,
                surface: Some(surface),
                cpu_time: self.r_clock.now_nsec(),
                gpu_time: None,
            });
        }
    }

    /// Import a dmabuf as soon as it is created, so an unusable one can
    /// be refused before it is ever attached
    pub fn import_dmabuf(&mut self, buffer: &ClientBuffer) -> Result<()> {
        self.check_alive()?;
        if !matches!(&*buffer.kind(), BufferKind::Dmabuf(_)) {
            return Err(SquallError::UNSUPPORTED_BUFFER);
        }

        let mut ctx = AttachContext {
            dev: &self.r_dev,
            caps: self.r_caps,
            registry: &mut self.r_registry,
        };
        surface::dmabuf_buffer_state(&mut ctx, buffer).map(|_| ())
    }

    pub fn query_dmabuf_formats(&mut self) -> Vec<DrmFourcc> {
        self.r_formats.formats(&*self.r_dev, self.r_caps)
    }

    pub fn query_dmabuf_modifiers(&mut self, format: DrmFourcc) -> Vec<DrmModifier> {
        self.r_formats.modifiers(&*self.r_dev, self.r_caps, format)
    }

    /// The client destroyed a buffer
    pub fn buffer_destroyed(&mut self, buffer: &ClientBuffer) {
        for state in self.r_surfaces.values_mut() {
            state.buffer_destroyed(buffer);
        }
        buffer.mark_destroyed();
    }

    pub fn surface_destroyed(&mut self, surface: SurfaceId) {
        if let Some(mut state) = self.r_surfaces.remove(&surface) {
            log::debug!("Releasing surface {:?}", surface);
            state.release();
        }
    }

    /// Release every GPU resource the renderer holds
    ///
    /// Outputs are owned by the caller and free their own targets. Any
    /// further use of the renderer fails.
    pub fn destroy(&mut self) {
        if self.r_destroyed {
            return;
        }
        log::debug!("Destroying renderer");

        // Report what already finished, the rest is never read
        self.process_render_points();
        self.r_render_points.clear();

        for (_, mut state) in self.r_surfaces.drain() {
            state.release();
        }
        self.r_registry.release_all();
        self.r_fans.clear();
        self.r_destroyed = true;
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl RendererInterface for Renderer {
    fn output_create(&mut self, opts: &OutputOptions) -> Result<OutputState> {
        Renderer::output_create(self, opts)
    }

    fn output_destroy(&mut self, output: OutputState) {
        Renderer::output_destroy(self, output)
    }

    fn output_resize(
        &mut self,
        output: &mut OutputState,
        fb_size: (i32, i32),
        area: Rect<i32>,
    ) -> Result<()> {
        Renderer::output_resize(self, output, fb_size, area)
    }

    fn output_set_border(
        &mut self,
        output: &mut OutputState,
        side: BorderSide,
        width: i32,
        height: i32,
        data: Option<&[u8]>,
    ) -> Result<()> {
        Renderer::output_set_border(self, output, side, width, height, data)
    }

    fn repaint_output(
        &mut self,
        output: &mut OutputState,
        views: &[View],
        damage: &Region,
    ) -> Result<()> {
        Renderer::repaint_output(self, output, views, damage)
    }

    fn attach(
        &mut self,
        surface: SurfaceId,
        buffer: Option<&ClientBuffer>,
        acquire: Option<SyncFile>,
    ) -> Result<Option<SyncFile>> {
        Renderer::attach(self, surface, buffer, acquire)
    }

    fn flush_damage(&mut self, surface: SurfaceId, damage: &Region) {
        Renderer::flush_damage(self, surface, damage)
    }

    fn import_dmabuf(&mut self, buffer: &ClientBuffer) -> Result<()> {
        Renderer::import_dmabuf(self, buffer)
    }

    fn query_dmabuf_formats(&mut self) -> Vec<DrmFourcc> {
        Renderer::query_dmabuf_formats(self)
    }

    fn query_dmabuf_modifiers(&mut self, format: DrmFourcc) -> Vec<DrmModifier> {
        Renderer::query_dmabuf_modifiers(self, format)
    }

    fn buffer_destroyed(&mut self, buffer: &ClientBuffer) {
        Renderer::buffer_destroyed(self, buffer)
    }

    fn surface_destroyed(&mut self, surface: SurfaceId) {
        Renderer::surface_destroyed(self, surface)
    }
}
