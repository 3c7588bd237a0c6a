// The output repaint pipeline
//
// A repaint brings the output's current back buffer up to date with
// the view list. The damage the back buffer is missing is worked out
// from its age, the views are drawn opaque parts first, borders and
// captures are handled, and finally the frame is presented and its
// damage remembered for the buffers that come after it.
//
// Austin Shafer - 2020
use crate::capture::service_captures;
use crate::caps::Capabilities;
use crate::config::CreateInfo;
use crate::geometry::{texture_region, FanBuffer, View};
use crate::gpu::{GpuDevice, QueryId, ShaderConfig, ShaderVariant, Vertex};
use crate::output::{BorderSide, BorderStatus, OutputState};
use crate::surface::{SurfaceId, SurfaceState};
use crate::sync::SyncFile;
use crate::timeline::RenderPoint;
use crate::{Result, SquallError};
use utils::log;
use utils::region::{Rect, Region};

use std::collections::HashMap;
use std::sync::Arc;

/// Outline color of fans in fan debug mode
const FAN_DEBUG_COLOR: [f32; 4] = [1.0, 0.0, 1.0, 1.0];
/// Tints of the opaque and blended passes in fan debug mode
const OPAQUE_TINT: [f32; 4] = [0.0, 0.3, 0.0, 0.2];
const BLEND_TINT: [f32; 4] = [0.3, 0.0, 0.0, 0.2];

/// The steps of a repaint, in order
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RepaintStage {
    MakeCurrent,
    ComputeDamage,
    FanDebugPrepass,
    PartialUpdate,
    DrawViews,
    BlitShadow,
    DrawBorders,
    Capture,
    CompletionFence,
    ReleaseFences,
    Present,
    RotateDamage,
}

fn stage(output: &OutputState, stage: RepaintStage) {
    log::trace!("Output {}: {:?}", output.id(), stage);
}

/// Everything a repaint needs from the renderer
pub(crate) struct RepaintContext<'a> {
    pub dev: &'a Arc<dyn GpuDevice>,
    pub caps: Capabilities,
    pub info: &'a CreateInfo,
    pub surfaces: &'a mut HashMap<SurfaceId, SurfaceState>,
    pub fans: &'a mut FanBuffer,
    pub fan_debug: bool,
    pub fan_debug_serial: u64,
    /// Record GPU timestamps for the timeline
    pub timing: bool,
    /// Frames whose timestamps haven't been reported yet
    pub render_points: &'a mut Vec<RenderPoint>,
}

/// How this frame is going to be consumed
#[derive(Debug, Copy, Clone)]
pub(crate) struct RepaintParams {
    /// Use this buffer age instead of asking the device
    pub age: Option<u32>,
    /// Present to the screen. Virtual outputs export instead.
    pub present: bool,
}

/// The part of every view which is not hidden by opaque views above it
///
/// `views` is ordered front to back.
fn visible_regions(views: &[View], output_rect: &Rect<i32>) -> Vec<Region> {
    let mut above = Region::new();

    views
        .iter()
        .map(|view| {
            let mut visible = Region::from_rect(view.bounding_box());
            visible.intersect_rect(output_rect);
            visible.subtract(&above);
            above.union(&view.opaque_global());
            visible
        })
        .collect()
}

fn use_shader(dev: &dyn GpuDevice, config: &ShaderConfig, surface: Option<&SurfaceState>) {
    if let Err(e) = dev.use_shader(config) {
        log::error!("Could not use shader {:?}: {:?}", config.variant, e);
        dev.use_fallback_shader();
        if let Some(buffer) = surface.and_then(|s| s.buffer()) {
            buffer.post_implementation_error("renderer could not compile a shader");
        }
    }
}

/// Draw whatever has been generated in the fan buffer
///
/// Returns true if anything was drawn.
fn draw_fans(
    dev: &dyn GpuDevice,
    fans: &mut FanBuffer,
    config: &ShaderConfig,
    blend: bool,
    fan_debug: bool,
    surface: Option<&SurfaceState>,
) -> bool {
    if fans.is_empty() {
        return false;
    }

    dev.set_blend(blend);
    use_shader(dev, config, surface);
    dev.draw_triangle_fans(&fans.fb_vertices, &fans.fb_fans);
    if fan_debug {
        dev.draw_lines(&fans.outline(), FAN_DEBUG_COLOR);
    }
    fans.clear();
    return true;
}

/// Draw one view
///
/// Opaque parts go first with blending disabled, the rest is blended.
fn draw_paint_node(
    ctx: &mut RepaintContext,
    view: &View,
    visible: &Region,
    damage: &Region,
    offset: (i32, i32),
    fan_debug: bool,
) {
    let repaint = visible.intersected(damage);
    if repaint.is_empty() {
        return;
    }

    let dev = ctx.dev.clone();
    let surface = match ctx.surfaces.get_mut(&view.surface) {
        Some(s) => s,
        None => {
            log::debug!("View of unknown surface {:?}", view.surface);
            return;
        }
    };
    if let Err(e) = surface.upload_pending() {
        log::error!("Could not upload {:?}: {:?}", view.surface, e);
        return;
    }
    let state = match surface.buffer_state() {
        Some(s) => s,
        None => return,
    };

    let config = {
        let bs = state.borrow();
        if !bs.is_drawable() {
            return;
        }
        let mut config = match bs.variant() {
            ShaderVariant::Solid => ShaderConfig::solid(bs.color()),
            variant => ShaderConfig::textured(variant, bs.texture_ids()),
        };
        config.alpha = view.alpha;
        config.y_invert = bs.is_y_inverted();
        config
    };

    // Every later command is queued behind this wait, so the fence is
    // only needed once
    if let Some(fence) = surface.take_acquire_fence() {
        if let Err(e) = dev.wait_sync_file(&fence) {
            log::error!("Failed to wait on acquire fence of {:?}: {:?}", view.surface, e);
            return;
        }
    }

    let opaque = view.opaque_local();
    let mut blended = Region::from_rect(view.surface_rect());
    blended.subtract(&opaque);
    let mut drew = false;

    if !opaque.is_empty() {
        let mut opaque_config = config.clone();
        // The alpha channel is garbage where the client promised opaque
        if opaque_config.variant == ShaderVariant::Rgba {
            opaque_config.variant = ShaderVariant::Rgbx;
        }
        if fan_debug {
            opaque_config.tint = Some(OPAQUE_TINT);
        }

        texture_region(view, &repaint, &opaque, offset, ctx.fans);
        drew |= draw_fans(
            &*dev,
            ctx.fans,
            &opaque_config,
            false,
            fan_debug,
            Some(&*surface),
        );
    }

    if !blended.is_empty() {
        let mut blend_config = config;
        if fan_debug {
            blend_config.tint = Some(BLEND_TINT);
        }

        texture_region(view, &repaint, &blended, offset, ctx.fans);
        drew |= draw_fans(
            &*dev,
            ctx.fans,
            &blend_config,
            true,
            fan_debug,
            Some(&*surface),
        );
    }

    if drew {
        surface.set_used_in_output_repaint(true);
    }
}

/// Draw every view, back to front
fn draw_views(
    ctx: &mut RepaintContext,
    views: &[View],
    visible: &[Region],
    damage: &Region,
    offset: (i32, i32),
    fan_debug: bool,
) {
    for (view, vis) in views.iter().zip(visible.iter()).rev() {
        draw_paint_node(ctx, view, vis, damage, offset, fan_debug);
    }
}

/// Push a rectangle in framebuffer pixels with texture coordinates
/// `tex` (s1, t1, s2, t2)
fn push_rect(fans: &mut FanBuffer, r: &Rect<i32>, tex: [f32; 4]) {
    let (x1, y1, x2, y2) = (
        r.r_pos.0 as f32,
        r.r_pos.1 as f32,
        r.x2() as f32,
        r.y2() as f32,
    );
    fans.fb_vertices.extend_from_slice(&[
        Vertex::new(x1, y1, tex[0], tex[1]),
        Vertex::new(x2, y1, tex[2], tex[1]),
        Vertex::new(x2, y2, tex[2], tex[3]),
        Vertex::new(x1, y2, tex[0], tex[3]),
    ]);
    fans.fb_fans.push(4);
}

/// Copy the damaged part of the shadow buffer to the framebuffer
fn blit_shadow(ctx: &mut RepaintContext, output: &OutputState, damage: &Region) {
    let shadow = match output.os_shadow.as_ref() {
        Some(s) => s,
        None => return,
    };
    let (dx, dy) = output.fb_offset();
    let (px, py) = output.position();
    let area = output.area();
    let (w, h) = (area.r_size.0 as f32, area.r_size.1 as f32);

    let mut clipped = damage.clone();
    clipped.intersect_rect(&output.global_rect());
    for r in clipped.rects() {
        let fb = Rect::new(r.r_pos.0 + dx, r.r_pos.1 + dy, r.r_size.0, r.r_size.1);
        let s1 = (r.r_pos.0 - px) as f32 / w;
        let t1 = (r.r_pos.1 - py) as f32 / h;
        let s2 = (r.x2() - px) as f32 / w;
        let t2 = (r.y2() - py) as f32 / h;
        push_rect(ctx.fans, &fb, [s1, t1, s2, t2]);
    }

    let config = ShaderConfig::textured(ShaderVariant::Rgba, vec![shadow.st_texture.id()]);
    draw_fans(&**ctx.dev, ctx.fans, &config, false, false, None);
}

/// Draw the border sides marked in `status`
fn draw_borders(ctx: &mut RepaintContext, output: &OutputState, status: BorderStatus) {
    if status == BorderStatus::CLEAN {
        return;
    }

    for side in BorderSide::ALL.iter() {
        if !status.contains(side.flag()) {
            continue;
        }
        let texture = match output.border(*side).ob_texture.as_ref() {
            Some(t) => t,
            None => continue,
        };
        let rect = output.border_rect(*side);
        if rect.is_empty() {
            continue;
        }

        push_rect(ctx.fans, &rect, [0.0, 0.0, 1.0, 1.0]);
        let config = ShaderConfig::textured(ShaderVariant::Rgba, vec![texture.id()]);
        draw_fans(&**ctx.dev, ctx.fans, &config, false, false, None);
    }
}

fn write_timestamp(dev: &dyn GpuDevice, caps: Capabilities, timing: bool) -> Option<QueryId> {
    if !timing || !caps.contains(Capabilities::TIMER_QUERY) {
        return None;
    }
    match dev.write_timestamp() {
        Ok(q) => Some(q),
        Err(e) => {
            log::debug!("Could not write timestamp: {:?}", e);
            None
        }
    }
}

/// Keep the timestamps of this frame until its fence signals
fn add_render_point(
    ctx: &mut RepaintContext,
    output: &OutputState,
    begin: Option<QueryId>,
    end: Option<QueryId>,
    fence: Option<&SyncFile>,
) {
    let fence = fence.and_then(|f| f.try_clone().ok());
    match (begin, end, fence) {
        (Some(b), Some(e), Some(f)) => {
            let point = RenderPoint::new(ctx.dev, output.id(), b, e, f);
            ctx.render_points.push(point);
        }
        (b, e, _) => {
            for q in b.iter().chain(e.iter()) {
                ctx.dev.destroy_query(*q);
            }
        }
    }
}

/// Repaint one output
///
/// `output_damage` is in global coordinates. Returns the fence which
/// signals once the GPU is done with this frame, if the device has
/// native fences.
pub(crate) fn repaint_output(
    ctx: &mut RepaintContext,
    output: &mut OutputState,
    views: &[View],
    output_damage: &Region,
    params: &RepaintParams,
) -> Result<Option<SyncFile>> {
    let dev = ctx.dev.clone();
    let fan_debug = ctx.fan_debug;
    let target = output.target().id();
    let (fb_w, fb_h) = output.fb_size();
    let fb_rect = Rect::new(0, 0, fb_w, fb_h);

    stage(output, RepaintStage::MakeCurrent);
    if let Err(e) = dev.make_current(target) {
        log::error!("Could not make output {} current: {:?}", output.id(), e);
        return Err(SquallError::MAKE_CURRENT_FAILED);
    }
    let begin = write_timestamp(&*dev, ctx.caps, ctx.timing);

    stage(output, RepaintStage::ComputeDamage);
    let mut age = match params.age {
        Some(age) => age,
        None if ctx.caps.contains(Capabilities::BUFFER_AGE) && !ctx.info.disable_buffer_age => {
            dev.buffer_age(target)
        }
        None => 0,
    };
    let damage_all = output.os_fan_debug_serial != ctx.fan_debug_serial;
    if damage_all {
        log::debug!("Fan debug toggled, repainting output {}", output.id());
        output.os_fan_debug_serial = ctx.fan_debug_serial;
        age = 0;
    }

    let global = output.global_rect();
    let full = Region::from_rect(global);
    let mut output_damage = output_damage.clone();
    output_damage.intersect_rect(&global);
    // The whole area is damaged so the ring, shadow and present hints
    // all see the full repaint
    if damage_all || output.os_border_status.contains(BorderStatus::SIZE_CHANGED) {
        output_damage = full.clone();
    }

    let (mut total_damage, mut border_status) = output.get_damage(age);
    total_damage.union(&output_damage);
    border_status |= output.os_border_status;

    let visible = visible_regions(views, &global);

    if ctx.fan_debug {
        stage(output, RepaintStage::FanDebugPrepass);
        // Clear the outlines left in the parts not being redrawn
        let mut undamaged = full.clone();
        undamaged.subtract(&output_damage);
        dev.bind_target(target, &fb_rect);
        draw_views(ctx, views, &visible, &undamaged, output.fb_offset(), false);
    }

    if ctx.caps.contains(Capabilities::PARTIAL_UPDATE)
        && !ctx.info.disable_partial_update
        && !ctx.fan_debug
    {
        stage(output, RepaintStage::PartialUpdate);
        let rects = output.to_present_rects(&total_damage, &output.border_damage(border_status));
        dev.set_damage_region(target, &rects);
    }

    stage(output, RepaintStage::DrawViews);
    let shadow = output
        .os_shadow
        .as_ref()
        .map(|s| (s.st_target.id(), s.st_fresh));
    match shadow {
        Some((shadow_target, fresh)) => {
            let area = output.area();
            let shadow_damage = match fresh || ctx.info.force_full_shadow_redraw {
                true => full.clone(),
                false => output_damage.clone(),
            };
            let (px, py) = output.position();
            dev.bind_target(
                shadow_target,
                &Rect::new(0, 0, area.r_size.0, area.r_size.1),
            );
            draw_views(ctx, views, &visible, &shadow_damage, (-px, -py), fan_debug);
            if let Some(s) = output.os_shadow.as_mut() {
                s.st_fresh = false;
            }

            stage(output, RepaintStage::BlitShadow);
            dev.bind_target(target, &fb_rect);
            blit_shadow(ctx, output, &total_damage);
        }
        None => {
            dev.bind_target(target, &fb_rect);
            let offset = output.fb_offset();
            draw_views(ctx, views, &visible, &total_damage, offset, fan_debug);
        }
    }

    stage(output, RepaintStage::DrawBorders);
    draw_borders(ctx, output, border_status);

    stage(output, RepaintStage::Capture);
    service_captures(&*dev, ctx.caps, output);

    stage(output, RepaintStage::CompletionFence);
    let end = write_timestamp(&*dev, ctx.caps, ctx.timing);
    let fence = dev.create_fence();
    add_render_point(ctx, output, begin, end, fence.as_ref());

    let mut present_res = Ok(());
    if params.present {
        stage(output, RepaintStage::Present);
        let rects = match !ctx.fan_debug && ctx.caps.contains(Capabilities::PARTIAL_UPDATE) {
            true => Some(output.to_present_rects(&output_damage, &output.border_damage(border_status))),
            false => None,
        };
        present_res = dev.present(target, rects.as_deref()).map_err(|e| {
            log::error!("Presenting output {} failed: {:?}", output.id(), e);
            SquallError::PRESENT_FAILED
        });
    }

    stage(output, RepaintStage::ReleaseFences);
    for surface in ctx.surfaces.values_mut() {
        if !surface.used_in_output_repaint() {
            continue;
        }
        surface.set_used_in_output_repaint(false);
        if let Some(fence) = fence.as_ref() {
            match fence.try_clone() {
                Ok(f) => surface.release_slot().replace(f),
                Err(e) => log::error!("Could not dup release fence: {:?}", e),
            }
        }
    }

    stage(output, RepaintStage::RotateDamage);
    let status = output.os_border_status;
    output.rotate_damage(&output_damage, status);
    output.os_border_status = BorderStatus::CLEAN;

    present_res.map(|_| fence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_views_hide_what_is_below() {
        let output = Rect::new(0, 0, 100, 100);
        let top = View::new(SurfaceId(1), 50, 50)
            .with_opaque(Region::from_rect(Rect::new(0, 0, 50, 50)));
        let bottom = View::new(SurfaceId(2), 100, 100);

        let visible = visible_regions(&[top, bottom], &output);
        assert_eq!(visible[0], Region::from_rect(Rect::new(0, 0, 50, 50)));
        assert_eq!(visible[1].area(), 100 * 100 - 50 * 50);
    }

    #[test]
    fn translucent_views_hide_nothing() {
        let output = Rect::new(0, 0, 100, 100);
        let top = View::new(SurfaceId(1), 50, 50)
            .with_opaque(Region::from_rect(Rect::new(0, 0, 50, 50)))
            .with_alpha(0.5);
        let bottom = View::new(SurfaceId(2), 100, 100);

        let visible = visible_regions(&[top, bottom], &output);
        assert_eq!(visible[1].area(), 100 * 100);
    }

    #[test]
    fn views_are_clipped_to_the_output() {
        let output = Rect::new(0, 0, 100, 100);
        let view = View::new(SurfaceId(1), 100, 100).at(50, 50);
        let visible = visible_regions(&[view], &output);
        assert_eq!(visible[0], Region::from_rect(Rect::new(50, 50, 50, 50)));
    }
}
