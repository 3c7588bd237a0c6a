// Render timing for the timeline
//
// Each repaint brackets its GPU work with two timestamp queries and
// keeps them alongside the completion fence of the frame. Once the
// fence signals the timestamps are read back and reported.
//
// Austin Shafer - 2024
use crate::gpu::{GpuDevice, QueryId};
use crate::surface::SurfaceId;
use crate::sync::SyncFile;
use utils::log;

use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimelinePoint {
    /// Damage was flushed for a surface
    CoreFlushDamage,
    /// The GPU started rendering an output
    RendererGpuBegin,
    /// The GPU finished rendering an output
    RendererGpuEnd,
}

/// One event on the timeline
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineRecord {
    pub point: TimelinePoint,
    pub output: Option<u64>,
    pub surface: Option<SurfaceId>,
    /// Monotonic CPU time in nanoseconds
    pub cpu_time: u64,
    /// GPU timestamp in nanoseconds, for renderer points
    pub gpu_time: Option<u64>,
}

/// Consumer of timeline events
pub trait TimelineSink {
    fn record(&mut self, record: &TimelineRecord);
}

/// Report timeline events as tracing events
#[derive(Debug, Default)]
pub struct TracingTimeline;

impl TimelineSink for TracingTimeline {
    fn record(&mut self, record: &TimelineRecord) {
        log::info!(
            target: "squall::timeline",
            point = ?record.point,
            output = ?record.output,
            surface = ?record.surface,
            cpu_time = record.cpu_time,
            gpu_time = ?record.gpu_time,
            "timeline"
        );
    }
}

/// The GPU timing of one repaint
///
/// The queries are freed when this is dropped.
pub(crate) struct RenderPoint {
    rp_dev: Arc<dyn GpuDevice>,
    rp_output: u64,
    rp_begin: QueryId,
    rp_end: QueryId,
    rp_fence: SyncFile,
}

impl RenderPoint {
    pub fn new(
        dev: &Arc<dyn GpuDevice>,
        output: u64,
        begin: QueryId,
        end: QueryId,
        fence: SyncFile,
    ) -> Self {
        Self {
            rp_dev: dev.clone(),
            rp_output: output,
            rp_begin: begin,
            rp_end: end,
            rp_fence: fence,
        }
    }

    pub fn fence(&self) -> &SyncFile {
        &self.rp_fence
    }

    /// Has the GPU finished this frame
    fn is_complete(&self) -> bool {
        self.rp_dev.sync_file_signaled(&self.rp_fence)
    }

    /// Read back both timestamps
    ///
    /// Returns None if the results are not available yet.
    fn resolve(&self) -> Option<(u64, u64)> {
        let begin = self.rp_dev.get_timestamp(self.rp_begin);
        let end = self.rp_dev.get_timestamp(self.rp_end);

        match (begin, end) {
            (Ok(Some(b)), Ok(Some(e))) => Some((b, e)),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Could not read render timestamps: {:?}", e);
                None
            }
            _ => None,
        }
    }
}

impl Drop for RenderPoint {
    fn drop(&mut self) {
        self.rp_dev.destroy_query(self.rp_begin);
        self.rp_dev.destroy_query(self.rp_end);
    }
}

impl std::fmt::Debug for RenderPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPoint")
            .field("output", &self.rp_output)
            .field("begin", &self.rp_begin)
            .field("end", &self.rp_end)
            .field("fence", &self.rp_fence.point())
            .finish()
    }
}

/// Report every render point whose frame has finished
///
/// Points which are not complete are kept for a later call. Points
/// whose timestamps can't be read are dropped with an error.
pub(crate) fn process_render_points(
    points: &mut Vec<RenderPoint>,
    cpu_time: u64,
    sink: &mut dyn TimelineSink,
) {
    let mut i = 0;
    while i < points.len() {
        if !points[i].is_complete() {
            i += 1;
            continue;
        }

        let point = points.remove(i);
        if let Some((begin, end)) = point.resolve() {
            for (tp, time) in [
                (TimelinePoint::RendererGpuBegin, begin),
                (TimelinePoint::RendererGpuEnd, end),
            ] {
                sink.record(&TimelineRecord {
                    point: tp,
                    output: Some(point.rp_output),
                    surface: None,
                    cpu_time: cpu_time,
                    gpu_time: Some(time),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capabilities;
    use crate::headless::HeadlessDevice;

    #[derive(Default)]
    struct Collect(Vec<TimelineRecord>);

    impl TimelineSink for Collect {
        fn record(&mut self, record: &TimelineRecord) {
            self.0.push(record.clone());
        }
    }

    #[test]
    fn points_wait_for_their_fence() {
        let headless = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let dev: Arc<dyn GpuDevice> = headless.clone();

        let begin = dev.write_timestamp().unwrap();
        let end = dev.write_timestamp().unwrap();
        let fence = dev.create_fence().unwrap();
        let mut points = vec![RenderPoint::new(&dev, 7, begin, end, fence)];
        let mut sink = Collect::default();

        process_render_points(&mut points, 0, &mut sink);
        assert_eq!(points.len(), 1);
        assert!(sink.0.is_empty());

        headless.signal_all();
        process_render_points(&mut points, 5, &mut sink);
        assert!(points.is_empty());
        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[0].point, TimelinePoint::RendererGpuBegin);
        assert_eq!(sink.0[1].point, TimelinePoint::RendererGpuEnd);
        assert_eq!(sink.0[1].output, Some(7));
        assert!(sink.0[0].gpu_time < sink.0[1].gpu_time);
    }

    #[test]
    fn dropping_points_frees_queries() {
        let headless = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let dev: Arc<dyn GpuDevice> = headless.clone();

        let begin = dev.write_timestamp().unwrap();
        let end = dev.write_timestamp().unwrap();
        let fence = dev.create_fence().unwrap();
        let point = RenderPoint::new(&dev, 1, begin, end, fence);
        assert_eq!(headless.live_object_count(), 2);
        drop(point);
        assert_eq!(headless.live_object_count(), 0);
    }
}
