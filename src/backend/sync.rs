// Synchronization primitives
//
// Fences (GPU -> host) and semaphores (GPU -> GPU), each owning exactly one
// native handle and destroying it on drop. Callers must keep them alive until
// no pending submission references them.

use super::{DeviceBackend, ExternalHandleType, FenceWait};
use crate::error::{FrameError, Result};
use ash::vk;
use std::fmt;
use std::sync::Arc;

/// Host-observable completion signal.
pub struct Fence {
    backend: Arc<dyn DeviceBackend>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence; `signaled` fences let the first wait pass through.
    pub fn new(backend: Arc<dyn DeviceBackend>, signaled: bool) -> Result<Self> {
        let fence = backend.create_fence(signaled)?;
        log::trace!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );
        Ok(Self { backend, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until signaled or until `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<FenceWait> {
        self.backend.wait_fence(self.fence, timeout_ns)
    }

    /// Like `wait`, but a timeout becomes `FrameError::FenceTimeout`.
    pub fn wait_signaled(&self, timeout_ns: u64) -> Result<()> {
        match self.wait(timeout_ns)? {
            FenceWait::Signaled => Ok(()),
            FenceWait::TimedOut => Err(FrameError::FenceTimeout { timeout_ns }),
        }
    }

    /// Must not be called while a pending submission still signals it.
    pub fn reset(&self) -> Result<()> {
        self.backend.reset_fence(self.fence)
    }

    pub fn is_signaled(&self) -> Result<bool> {
        self.backend.fence_signaled(self.fence)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.backend.destroy_fence(self.fence);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fence").field(&self.fence).finish()
    }
}

/// GPU-side ordering edge between submissions (and presentation).
pub struct Semaphore {
    backend: Arc<dyn DeviceBackend>,
    semaphore: vk::Semaphore,
    #[cfg(unix)]
    external: ExternalHandles,
}

impl Semaphore {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        let semaphore = backend.create_semaphore(&[])?;
        Ok(Self {
            backend,
            semaphore,
            #[cfg(unix)]
            external: ExternalHandles::default(),
        })
    }

    /// Create a semaphore whose payload can be exported as each of `types`.
    /// The exported handles are fetched eagerly and closed when the
    /// semaphore is dropped.
    #[cfg(unix)]
    pub fn exportable(
        backend: Arc<dyn DeviceBackend>,
        types: &[ExternalHandleType],
    ) -> Result<Self> {
        let semaphore = backend.create_semaphore(types)?;
        let mut this = Self {
            backend,
            semaphore,
            external: ExternalHandles::default(),
        };
        for &handle_type in types {
            let fd = this.backend.export_semaphore_fd(this.semaphore, handle_type)?;
            this.external.insert(handle_type, fd);
        }
        Ok(this)
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Borrow an exported OS handle, if one of that type was requested.
    #[cfg(unix)]
    pub fn external_handle(
        &self,
        handle_type: ExternalHandleType,
    ) -> Option<std::os::fd::BorrowedFd<'_>> {
        self.external.get(handle_type)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.backend.destroy_semaphore(self.semaphore);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

/// Exported OS handles keyed by handle type, closed on drop.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct ExternalHandles {
    handles: Vec<(ExternalHandleType, std::os::fd::OwnedFd)>,
}

#[cfg(unix)]
impl ExternalHandles {
    /// Take ownership of `fd`. A previous handle of the same type is closed.
    pub fn insert(&mut self, handle_type: ExternalHandleType, fd: i32) {
        use std::os::fd::FromRawFd;
        // SAFETY: export calls hand us a fresh fd that nobody else owns.
        let owned = unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) };
        self.handles.retain(|(existing, _)| *existing != handle_type);
        self.handles.push((handle_type, owned));
    }

    pub fn get(&self, handle_type: ExternalHandleType) -> Option<std::os::fd::BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        self.handles
            .iter()
            .find(|(existing, _)| *existing == handle_type)
            .map(|(_, fd)| fd.as_fd())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// A semaphore to wait on and the stage that waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitSemaphore {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

impl WaitSemaphore {
    pub fn new(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        Self { semaphore, stage }
    }
}

/// Wait and signal lists for one submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPoints {
    pub waits: Vec<WaitSemaphore>,
    pub signals: Vec<vk::Semaphore>,
}

impl SyncPoints {
    pub fn new(waits: Vec<WaitSemaphore>, signals: Vec<vk::Semaphore>) -> Self {
        Self { waits, signals }
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.signals.is_empty()
    }

    pub fn extend(&mut self, other: SyncPoints) {
        let SyncPoints { waits, signals } = other;
        if !waits.is_empty() {
            self.extend_waits(waits);
        }
        if !signals.is_empty() {
            self.extend_signals(signals);
        }
    }

    pub fn extend_waits(&mut self, waits: impl IntoIterator<Item = WaitSemaphore>) {
        self.waits.extend(waits);
    }

    pub fn extend_signals(&mut self, signals: impl IntoIterator<Item = vk::Semaphore>) {
        self.signals.extend(signals);
    }

    /// `self` followed by `other`, leaving both inputs untouched.
    pub fn merged(&self, other: &SyncPoints) -> SyncPoints {
        let mut merged = self.clone();
        merged.extend(other.clone());
        merged
    }
}

impl fmt::Display for SyncPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waits=[")?;
        for wait in &self.waits {
            write!(f, "{:?}, ", wait.semaphore)?;
        }
        write!(f, "] signals=[")?;
        for signal in &self.signals {
            write!(f, "{:?}, ", signal)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeDevice;
    use ash::vk::Handle;
    #[cfg(target_os = "linux")]
    use std::path::Path;

    fn semaphore(raw: u64) -> vk::Semaphore {
        vk::Semaphore::from_raw(raw)
    }

    #[test]
    fn extend_appends_in_order() {
        let stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut sync = SyncPoints::new(
            vec![WaitSemaphore::new(semaphore(1), stage)],
            vec![semaphore(2)],
        );
        sync.extend(SyncPoints::new(
            vec![WaitSemaphore::new(semaphore(3), stage)],
            vec![semaphore(4)],
        ));

        let waits: Vec<u64> = sync.waits.iter().map(|w| w.semaphore.as_raw()).collect();
        let signals: Vec<u64> = sync.signals.iter().map(|s| s.as_raw()).collect();
        assert_eq!(waits, vec![1, 3]);
        assert_eq!(signals, vec![2, 4]);
    }

    #[test]
    fn merged_leaves_inputs_alone() {
        let base = SyncPoints::new(vec![], vec![semaphore(7)]);
        let extra = SyncPoints::new(vec![], vec![semaphore(8)]);
        let merged = base.merged(&extra);
        assert_eq!(base.signals.len(), 1);
        assert_eq!(merged.signals.len(), 2);
        assert!(SyncPoints::default().is_empty());
    }

    #[test]
    fn display_lists_handles() {
        let sync = SyncPoints::new(vec![], vec![semaphore(0x10)]);
        let text = sync.to_string();
        assert!(text.starts_with("waits=[] signals=["));
    }

    #[test]
    fn fence_and_semaphore_are_released_on_drop() {
        let device = FakeDevice::new();
        let backend: Arc<dyn DeviceBackend> = device.clone();
        {
            let fence = Fence::new(backend.clone(), true).unwrap();
            let _semaphore = Semaphore::new(backend.clone()).unwrap();
            assert_eq!(fence.wait(0).unwrap(), FenceWait::Signaled);
            assert_eq!(device.live_objects(), 2);
        }
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn unsignaled_fence_times_out_with_finite_wait() {
        let device = FakeDevice::new();
        let fence = Fence::new(device.clone(), false).unwrap();
        assert_eq!(fence.wait(1_000).unwrap(), FenceWait::TimedOut);
        match fence.wait_signaled(1_000) {
            Err(FrameError::FenceTimeout { timeout_ns }) => assert_eq!(timeout_ns, 1_000),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!fence.is_signaled().unwrap());
    }

    // Fd numbers are process-wide; keep the fd tests from reusing each other's
    #[cfg(target_os = "linux")]
    static FD_TESTS: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    #[cfg(target_os = "linux")]
    fn is_open(fd: i32) -> bool {
        std::fs::read_link(format!("/proc/self/fd/{}", fd))
            .is_ok_and(|target| target == Path::new("/dev/null"))
    }

    #[cfg(target_os = "linux")]
    fn dev_null() -> i32 {
        use std::os::fd::IntoRawFd;
        std::fs::File::open("/dev/null").unwrap().into_raw_fd()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn exported_fds_are_owned_and_closed_on_drop() {
        use std::os::fd::AsRawFd;

        let _guard = FD_TESTS.lock();
        let device = FakeDevice::new();
        let semaphore =
            Semaphore::exportable(device.clone(), &[ExternalHandleType::OpaqueFd]).unwrap();
        let opaque = semaphore.external_handle(ExternalHandleType::OpaqueFd).unwrap().as_raw_fd();
        assert!(semaphore.external_handle(ExternalHandleType::SyncFd).is_none());
        assert!(is_open(opaque));

        let both = [ExternalHandleType::OpaqueFd, ExternalHandleType::SyncFd];
        let shared = Semaphore::exportable(device.clone(), &both).unwrap();
        let fds: Vec<i32> = both
            .iter()
            .map(|&kind| shared.external_handle(kind).unwrap().as_raw_fd())
            .collect();
        assert_ne!(fds[0], fds[1]);
        assert!(fds.iter().all(|&fd| is_open(fd)));

        drop(semaphore);
        drop(shared);
        assert!(!is_open(opaque));
        assert!(fds.iter().all(|&fd| !is_open(fd)));
        assert_eq!(device.live_objects(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn inserting_same_handle_type_closes_previous_fd() {
        let _guard = FD_TESTS.lock();
        let mut handles = ExternalHandles::default();
        let first = dev_null();
        handles.insert(ExternalHandleType::SyncFd, first);
        let second = dev_null();
        handles.insert(ExternalHandleType::SyncFd, second);

        assert_eq!(handles.len(), 1);
        assert!(!is_open(first));
        assert!(is_open(second));
        drop(handles);
        assert!(!is_open(second));
    }

    #[test]
    fn reset_unsignals_fence() {
        let device = FakeDevice::new();
        let fence = Fence::new(device.clone(), true).unwrap();
        assert!(fence.is_signaled().unwrap());
        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
    }
}
