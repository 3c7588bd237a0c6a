// Sync file handling
//
// Explicit synchronization is done with sync files. Every fence the
// device hands out is tied to a point on its single GPU timeline.
//
// Austin Shafer - 2024
use nix::fcntl::{fcntl, FcntlArg};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::{Result, SquallError};
use utils::log;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// A fence exported as a file descriptor
///
/// The fd polls readable once the fence has signaled. Fences created by
/// the renderer also know the timeline point they were created for.
/// Fences handed to us by clients do not, their point is 0.
#[derive(Debug)]
pub struct SyncFile {
    sf_fd: OwnedFd,
    sf_point: u64,
}

impl SyncFile {
    pub fn new(fd: OwnedFd, point: u64) -> Self {
        Self {
            sf_fd: fd,
            sf_point: point,
        }
    }

    /// Wrap a client provided fence
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::new(fd, 0)
    }

    /// The device timeline point this fence signals at
    pub fn point(&self) -> u64 {
        self.sf_point
    }

    /// Duplicate the fd backing this fence
    ///
    /// The copy signals together with the original.
    pub fn try_clone(&self) -> Result<SyncFile> {
        let raw = match fcntl(self.sf_fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)) {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("could not dup sync file fd: {:?}", e);
                return Err(SquallError::INVALID_FD);
            }
        };

        Ok(SyncFile {
            // Safe since fcntl just handed us this fd
            sf_fd: unsafe { OwnedFd::from_raw_fd(raw) },
            sf_point: self.sf_point,
        })
    }

    /// Check if the fence has signaled without blocking
    pub fn poll_signaled(&self) -> bool {
        let mut fds = [PollFd::new(self.sf_fd.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                log::error!("Failed to poll sync file: {:?}", e);
                false
            }
        }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.sf_fd
    }
}

impl AsFd for SyncFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sf_fd.as_fd()
    }
}

/// The release fence slot of a surface
///
/// A surface keeps at most one outstanding release fence. A newer
/// fence may replace an older one without waiting, all of the fences
/// come from the same timeline and signal in order.
#[derive(Debug, Default)]
pub struct ReleaseSlot {
    rs_fence: Option<SyncFile>,
}

impl ReleaseSlot {
    pub fn new() -> Self {
        Self { rs_fence: None }
    }

    /// Replace the outstanding fence
    pub fn replace(&mut self, fence: SyncFile) {
        if let Some(old) = self.rs_fence.as_ref() {
            debug_assert!(old.point() <= fence.point());
            log::trace!(
                "Replacing release fence for point {} with {}",
                old.point(),
                fence.point()
            );
        }
        self.rs_fence = Some(fence);
    }

    pub fn take(&mut self) -> Option<SyncFile> {
        self.rs_fence.take()
    }

    pub fn peek(&self) -> Option<&SyncFile> {
        self.rs_fence.as_ref()
    }

    pub fn clear(&mut self) {
        self.rs_fence = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dup_signals_with_original() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let fence = SyncFile::new(rx, 4);
        let copy = fence.try_clone().unwrap();
        assert_eq!(copy.point(), 4);
        assert!(!fence.poll_signaled());
        assert!(!copy.poll_signaled());

        std::fs::File::from(tx).write_all(&[1]).unwrap();
        assert!(fence.poll_signaled());
        assert!(copy.poll_signaled());
    }

    #[test]
    fn release_slot_keeps_latest() {
        let mut slot = ReleaseSlot::new();
        let (a, _ta) = nix::unistd::pipe().unwrap();
        let (b, _tb) = nix::unistd::pipe().unwrap();
        slot.replace(SyncFile::new(a, 1));
        slot.replace(SyncFile::new(b, 2));
        assert_eq!(slot.take().unwrap().point(), 2);
        assert!(slot.peek().is_none());
    }
}
