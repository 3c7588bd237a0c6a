// Output capture
//
// Screenshooters and screen recorders queue capture tasks on an
// output. The renderer services them at the end of every repaint by
// reading back the freshly drawn framebuffer into the task's buffer.
//
// Austin Shafer - 2024
use crate::buffer::{BufferKind, ClientBuffer};
use crate::caps::Capabilities;
use crate::gpu::GpuDevice;
use crate::output::OutputState;
use drm_fourcc::DrmFourcc;
use utils::log;
use utils::region::Rect;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// What part of the output is being captured
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// The composited area, without borders
    Framebuffer,
    /// The whole framebuffer, including borders
    FullFramebuffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureResult {
    Complete,
    Failed(String),
}

/// A pending capture
///
/// A task must be retired exactly once, which is why retiring consumes
/// it.
pub struct CaptureTask {
    ct_source: CaptureSource,
    ct_buffer: ClientBuffer,
    ct_done: Box<dyn FnOnce(CaptureResult)>,
}

impl CaptureTask {
    pub fn new(
        source: CaptureSource,
        buffer: ClientBuffer,
        done: Box<dyn FnOnce(CaptureResult)>,
    ) -> Self {
        Self {
            ct_source: source,
            ct_buffer: buffer,
            ct_done: done,
        }
    }

    pub fn source(&self) -> CaptureSource {
        self.ct_source
    }

    pub fn buffer(&self) -> &ClientBuffer {
        &self.ct_buffer
    }

    pub fn retire_complete(self) {
        (self.ct_done)(CaptureResult::Complete);
    }

    pub fn retire_failed(self, msg: &str) {
        log::debug!("Capture failed: {}", msg);
        (self.ct_done)(CaptureResult::Failed(msg.to_string()));
    }
}

impl std::fmt::Debug for CaptureTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureTask")
            .field("source", &self.ct_source)
            .field("buffer", &self.ct_buffer.id())
            .finish()
    }
}

/// The capture tasks of one output
pub trait CaptureQueue {
    /// Get the next task for this source
    ///
    /// Only tasks whose buffer matches the given size and format are
    /// returned.
    fn pull_task(
        &mut self,
        source: CaptureSource,
        width: i32,
        height: i32,
        format: DrmFourcc,
    ) -> Option<CaptureTask>;
}

/// A plain queue of capture tasks
///
/// Clones share the same queue, so the compositor can keep a handle to
/// push tasks while the output owns another. Tasks whose buffer does
/// not fit the output are retired as failed when they reach the front.
#[derive(Debug, Clone, Default)]
pub struct OutputCaptureQueue {
    cq_tasks: Rc<RefCell<VecDeque<CaptureTask>>>,
}

impl OutputCaptureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: CaptureTask) {
        self.cq_tasks.borrow_mut().push_back(task);
    }

    pub fn len(&self) -> usize {
        self.cq_tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn buffer_matches(buffer: &ClientBuffer, width: i32, height: i32, format: DrmFourcc) -> bool {
    if buffer.size() != (width, height) {
        return false;
    }
    match &*buffer.kind() {
        BufferKind::Shm(shm) => shm.sb_format == format,
        _ => true,
    }
}

impl CaptureQueue for OutputCaptureQueue {
    fn pull_task(
        &mut self,
        source: CaptureSource,
        width: i32,
        height: i32,
        format: DrmFourcc,
    ) -> Option<CaptureTask> {
        let mut failed = Vec::new();
        let mut ret = None;
        {
            let mut tasks = self.cq_tasks.borrow_mut();
            let mut i = 0;
            while i < tasks.len() {
                if tasks[i].source() != source {
                    i += 1;
                    continue;
                }
                let task = tasks.remove(i)?;
                if buffer_matches(task.buffer(), width, height, format) {
                    ret = Some(task);
                    break;
                }
                failed.push(task);
            }
        }

        // Retire outside the borrow, the callback may queue more work
        for task in failed {
            task.retire_failed("buffer does not match the output");
        }
        ret
    }
}

/// Copy rows so the top row comes first
fn flip_rows(data: &mut [u8], stride: usize, height: usize) {
    for i in 0..height / 2 {
        let j = height - 1 - i;
        let (top, bottom) = data.split_at_mut(j * stride);
        top[i * stride..(i + 1) * stride].swap_with_slice(&mut bottom[..stride]);
    }
}

/// Read back one task
fn capture_one(
    dev: &dyn GpuDevice,
    caps: Capabilities,
    output: &OutputState,
    rect: &Rect<i32>,
    task: CaptureTask,
) {
    let shm = match &*task.buffer().kind() {
        BufferKind::Shm(shm) => Some((shm.sb_pool.clone(), shm.sb_offset, shm.sb_stride)),
        _ => None,
    };
    let (pool, offset, stride) = match shm {
        Some(shm) => shm,
        None => return task.retire_failed("unsupported buffer"),
    };
    if stride % 4 != 0 {
        return task.retire_failed("buffer stride not a multiple of 4");
    }

    let height = rect.r_size.1 as usize;
    let len = stride as usize * height;
    let res = {
        let mut pool = pool.borrow_mut();
        match pool.get_mut(offset..offset + len) {
            Some(data) => {
                let res =
                    dev.read_pixels(output.target().id(), rect, output.vk_format(), stride, data);
                if res.is_ok() && !caps.contains(Capabilities::PACK_REVERSE_ROW_ORDER) {
                    flip_rows(data, stride as usize, height);
                }
                res.map_err(|e| e.to_string())
            }
            None => Err("buffer is smaller than its size".to_string()),
        }
    };

    match res {
        Ok(()) => task.retire_complete(),
        Err(e) => {
            log::error!("Reading output {} failed: {}", output.id(), e);
            task.retire_failed("capture failed")
        }
    }
}

/// Service all pending captures of an output
///
/// Called after the frame has been drawn but before it is presented.
pub(crate) fn service_captures(dev: &dyn GpuDevice, caps: Capabilities, output: &mut OutputState) {
    let mut queue = match output.os_capture.take() {
        Some(q) => q,
        None => return,
    };

    let (fb_w, fb_h) = output.fb_size();
    for (source, rect) in [
        (CaptureSource::Framebuffer, output.area()),
        (CaptureSource::FullFramebuffer, Rect::new(0, 0, fb_w, fb_h)),
    ] {
        while let Some(task) =
            queue.pull_task(source, rect.r_size.0, rect.r_size.1, output.format())
        {
            capture_one(dev, caps, output, &rect, task);
        }
    }

    output.os_capture = Some(queue);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ShmBuffer;

    fn shm_buffer(id: u64, w: i32, h: i32, format: DrmFourcc) -> ClientBuffer {
        let pool = Rc::new(RefCell::new(vec![0u8; (w * h * 4) as usize]));
        ClientBuffer::new_shm(id, ShmBuffer::new(pool, 0, w as u32 * 4, format), w, h)
    }

    fn task(
        source: CaptureSource,
        buffer: ClientBuffer,
        results: &Rc<RefCell<Vec<(u64, CaptureResult)>>>,
    ) -> CaptureTask {
        let results = results.clone();
        let id = buffer.id();
        CaptureTask::new(
            source,
            buffer,
            Box::new(move |res| results.borrow_mut().push((id, res))),
        )
    }

    #[test]
    fn mismatching_tasks_fail() {
        let results = Rc::new(RefCell::new(Vec::new()));
        let mut queue = OutputCaptureQueue::new();
        queue.push(task(
            CaptureSource::Framebuffer,
            shm_buffer(1, 10, 10, DrmFourcc::Xrgb8888),
            &results,
        ));
        queue.push(task(
            CaptureSource::FullFramebuffer,
            shm_buffer(2, 20, 20, DrmFourcc::Xrgb8888),
            &results,
        ));
        queue.push(task(
            CaptureSource::Framebuffer,
            shm_buffer(3, 20, 20, DrmFourcc::Xrgb8888),
            &results,
        ));

        let t = queue
            .pull_task(CaptureSource::Framebuffer, 20, 20, DrmFourcc::Xrgb8888)
            .unwrap();
        assert_eq!(t.buffer().id(), 3);
        assert_eq!(
            *results.borrow(),
            vec![(
                1,
                CaptureResult::Failed("buffer does not match the output".to_string())
            )]
        );
        // The other source is left alone
        assert_eq!(queue.len(), 1);

        t.retire_complete();
        assert_eq!(results.borrow()[1], (3, CaptureResult::Complete));
    }

    #[test]
    fn flip() {
        let mut data = vec![0u8, 0, 1, 1, 2, 2];
        flip_rows(&mut data, 2, 3);
        assert_eq!(data, vec![2, 2, 1, 1, 0, 0]);
    }
}
