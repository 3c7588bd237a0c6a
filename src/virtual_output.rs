// Virtual outputs
//
// A virtual output renders into a small ring of offscreen targets
// instead of a swapchain. Every finished frame is exported and handed
// to a submit callback (a remote desktop stream, a screen recorder).
// The consumer tells us when it is done with a frame so its target can
// be reused.
//
// Austin Shafer - 2024
use crate::gpu::GpuDevice;
use crate::output::OutputState;
use crate::{Result, SquallError};
use utils::log;

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

/// Number of offscreen targets a virtual output cycles through
pub(crate) const VIRTUAL_BUFFER_COUNT: usize = 2;

/// Hands an exported frame (fd, stride) to its consumer
pub type SubmitFn = Box<dyn FnMut(OwnedFd, u32) -> utils::Result<()>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was rendered and submitted
    Submitted,
    /// Every target is still held by the consumer, nothing was drawn
    Skipped,
}

#[derive(Debug, Default, Copy, Clone)]
struct VirtualSlot {
    vs_busy: bool,
    /// The frame number this target was last rendered for
    vs_last_frame: Option<u64>,
}

pub struct VirtualOutput {
    pub(crate) vo_output: OutputState,
    vo_slots: Vec<VirtualSlot>,
    /// Submitted slots, oldest first
    vo_in_flight: VecDeque<usize>,
    vo_frame: u64,
    vo_submit: SubmitFn,
}

impl VirtualOutput {
    pub(crate) fn new(output: OutputState, submit: SubmitFn) -> Self {
        let count = output.target_count();
        Self {
            vo_output: output,
            vo_slots: vec![VirtualSlot::default(); count],
            vo_in_flight: VecDeque::new(),
            vo_frame: 0,
            vo_submit: submit,
        }
    }

    pub fn output(&self) -> &OutputState {
        &self.vo_output
    }

    pub fn output_mut(&mut self) -> &mut OutputState {
        &mut self.vo_output
    }

    /// Frames handed to the consumer which it hasn't finished with
    pub fn frames_in_flight(&self) -> usize {
        self.vo_in_flight.len()
    }

    /// Pick a free target for the next frame
    ///
    /// Returns the slot and its buffer age.
    pub(crate) fn begin_frame(&mut self) -> Result<(usize, u32)> {
        let frame = self.vo_frame + 1;
        let slot = self
            .vo_slots
            .iter()
            .position(|s| !s.vs_busy)
            .ok_or(SquallError::NO_FREE_BUFFER)?;
        let age = match self.vo_slots[slot].vs_last_frame {
            Some(last) => (frame - last) as u32,
            None => 0,
        };

        self.vo_output.set_current_target(slot);
        Ok((slot, age))
    }

    /// Export the frame just drawn into `slot` and submit it
    ///
    /// A failed submit leaves the slot free, its contents are not
    /// trusted for buffer age afterwards.
    pub(crate) fn submit_frame(&mut self, dev: &dyn GpuDevice, slot: usize) -> Result<FrameStatus> {
        self.vo_frame += 1;
        let target = self.vo_output.target().id();

        let res = dev
            .export_target(target)
            .map_err(|e| format!("export failed: {:?}", e))
            .and_then(|(fd, stride)| {
                (self.vo_submit)(fd, stride).map_err(|e| format!("submit failed: {:?}", e))
            });

        match res {
            Ok(()) => {
                self.vo_slots[slot].vs_busy = true;
                self.vo_slots[slot].vs_last_frame = Some(self.vo_frame);
                self.vo_in_flight.push_back(slot);
                Ok(FrameStatus::Submitted)
            }
            Err(e) => {
                log::error!("Virtual output {}: {}", self.vo_output.id(), e);
                self.vo_slots[slot].vs_last_frame = None;
                Err(SquallError::SUBMIT_FAILED)
            }
        }
    }

    /// The consumer finished with the oldest submitted frame
    ///
    /// `timestamp` is when the frame was shown, in nanoseconds. Returns
    /// false if no frame was in flight.
    pub fn finish_frame(&mut self, timestamp: u64) -> bool {
        let slot = match self.vo_in_flight.pop_front() {
            Some(s) => s,
            None => {
                log::error!(
                    "Virtual output {}: finished a frame that was never submitted",
                    self.vo_output.id()
                );
                return false;
            }
        };

        log::debug!(
            "Virtual output {}: frame in slot {} finished at {}",
            self.vo_output.id(),
            slot,
            timestamp
        );
        self.vo_slots[slot].vs_busy = false;
        true
    }
}

impl std::fmt::Debug for VirtualOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualOutput")
            .field("output", &self.vo_output)
            .field("slots", &self.vo_slots)
            .field("in_flight", &self.vo_in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capabilities;
    use crate::gpu::TargetKind;
    use crate::headless::HeadlessDevice;
    use crate::output::OutputOptions;

    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn virtual_output(
        headless: &Arc<HeadlessDevice>,
        submitted: Rc<RefCell<Vec<u32>>>,
        fail: Rc<RefCell<bool>>,
    ) -> VirtualOutput {
        let dev: Arc<dyn GpuDevice> = headless.clone();
        let output = OutputState::new(
            &dev,
            Capabilities::all(),
            1,
            &OutputOptions::new(16, 16),
            TargetKind::Offscreen,
            VIRTUAL_BUFFER_COUNT,
        )
        .unwrap();

        VirtualOutput::new(
            output,
            Box::new(move |_fd, stride| {
                if *fail.borrow() {
                    return Err(utils::anyhow!("consumer went away"));
                }
                submitted.borrow_mut().push(stride);
                Ok(())
            }),
        )
    }

    #[test]
    fn slots_cycle_and_age() {
        let headless = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let submitted = Rc::new(RefCell::new(Vec::new()));
        let mut vo = virtual_output(&headless, submitted.clone(), Rc::new(RefCell::new(false)));

        assert_eq!(vo.begin_frame(), Ok((0, 0)));
        assert_eq!(vo.submit_frame(&*headless, 0), Ok(FrameStatus::Submitted));
        assert_eq!(vo.begin_frame(), Ok((1, 0)));
        assert_eq!(vo.submit_frame(&*headless, 1), Ok(FrameStatus::Submitted));

        // Both targets are held by the consumer
        assert_eq!(vo.begin_frame(), Err(SquallError::NO_FREE_BUFFER));
        assert!(vo.finish_frame(100));
        assert_eq!(vo.begin_frame(), Ok((0, 2)));
        assert_eq!(*submitted.borrow(), vec![64, 64]);
    }

    #[test]
    fn failed_submit_frees_the_slot() {
        let headless = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let fail = Rc::new(RefCell::new(true));
        let mut vo = virtual_output(&headless, Rc::new(RefCell::new(Vec::new())), fail.clone());

        assert_eq!(vo.begin_frame(), Ok((0, 0)));
        assert_eq!(
            vo.submit_frame(&*headless, 0),
            Err(SquallError::SUBMIT_FAILED)
        );
        assert_eq!(vo.frames_in_flight(), 0);
        assert_eq!(vo.begin_frame(), Ok((0, 0)));
        assert!(!vo.finish_frame(0));
    }
}
