// Error types
//
// Three kinds of failure leave this crate:
// - fatal backend errors (Vulkan result codes, allocator failures)
// - programmer errors in the slot/ring protocol (double begin, etc.)
// - expected acquisition/presentation conditions, which are NOT errors on
//   the direct API and travel as `AcquisitionFailure` values instead

use ash::vk;
use std::fmt;
use thiserror::Error;

/// Error type for every fallible operation in the crate.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A backend call returned a non-success code.
    #[error("{op}: {result}")]
    Vulkan { op: &'static str, result: vk::Result },

    /// The memory allocator refused a request.
    #[error("{op}: {source}")]
    Allocation {
        op: &'static str,
        #[source]
        source: gpu_allocator::AllocationError,
    },

    /// Device or instance creation could not find what it needs.
    #[error("device creation failed: {0}")]
    DeviceCreation(String),

    /// `begin` was called on a slot that is already recording.
    #[error("double begin on render slot {slot}")]
    DoubleBegin { slot: usize },

    /// `finish` was called on a slot that is not recording.
    #[error("finish before begin on render slot {slot}")]
    FinishWithoutBegin { slot: usize },

    /// A readback was requested from a slot created without one.
    #[error("no readback enabled on render slot {slot}")]
    ReadbackNotConfigured { slot: usize },

    #[error("slot index {index} out of range (depth {depth})")]
    SlotOutOfRange { index: usize, depth: usize },

    #[error("render target depth must be at least 1")]
    InvalidDepth,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bounded fence wait expired. The GPU work may still complete later.
    #[error("fence wait timed out after {timeout_ns}ns")]
    FenceTimeout { timeout_ns: u64 },

    /// Only raised through the `RenderTarget` trait, which has no typed
    /// outcome channel for acquisition.
    #[error("swap chain acquisition failed: {0}")]
    Acquisition(AcquisitionFailure),

    #[error("a working set is still recording")]
    WorkingSetActive,

    #[error("no working set is recording")]
    NoActiveWorkingSet,

    /// The device was created without the capability this call needs.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Expected, recoverable outcomes of acquire/present.
///
/// The caller is expected to resize and retry on any of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AcquisitionFailure {
    NotReady,
    Timeout,
    Suboptimal,
    OutOfDate,
}

impl AcquisitionFailure {
    /// Map a raw result code onto the recoverable set, if it belongs there.
    pub fn from_vk(result: vk::Result) -> Option<Self> {
        match result {
            vk::Result::NOT_READY => Some(Self::NotReady),
            vk::Result::TIMEOUT => Some(Self::Timeout),
            vk::Result::SUBOPTIMAL_KHR => Some(Self::Suboptimal),
            vk::Result::ERROR_OUT_OF_DATE_KHR => Some(Self::OutOfDate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Timeout => "timeout",
            Self::Suboptimal => "suboptimal",
            Self::OutOfDate => "out_of_date",
        }
    }
}

impl fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attach an operation description to a raw ash result.
pub trait VkResultExt<T> {
    fn require(self, op: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn require(self, op: &'static str) -> Result<T> {
        self.map_err(|result| FrameError::Vulkan { op, result })
    }
}
