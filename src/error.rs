use ash::vk;
use thiserror::Error;

/// A Vulkan result code carried by [`Error::External`].
///
/// Wraps [`vk::Result`] so that driver failures keep their native code for
/// diagnostic logging while still being a proper error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct VulkanError(pub vk::Result);

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        VulkanError(result)
    }
}

/// Errors produced by device, frame, and interop operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No Vulkan driver library could be loaded.
    #[error("unable to open the Vulkan driver library: {0}")]
    DriverNotFound(#[from] ash::LoadingError),

    /// A capability this crate cannot operate without is absent.
    ///
    /// The only non-negotiable device capability is timeline semaphore
    /// support. Explicitly requested diagnostics (debug utils under
    /// `debug=1`) are treated the same way rather than silently skipped.
    #[error("missing required feature: {0}")]
    MissingRequiredFeature(&'static str),

    /// The requested format/tiling/usage combination has no viable
    /// representation on this device. Returned, not panicked; callers are
    /// expected to branch on it.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No entry in the device's memory type table satisfies the requested
    /// property flags under the requirement bitmask.
    #[error("no memory type found for flags {0:?}")]
    NoSuitableType(vk::MemoryPropertyFlags),

    /// The driver rejected a memory allocation.
    #[error("device memory allocation failed: {0}")]
    OutOfMemory(VulkanError),

    /// The physical device reports zero queue families.
    #[error("device reports no queue families")]
    NoQueues,

    /// No physical device matched the selection criteria.
    #[error("no physical device matches {0}")]
    NoDevice(String),

    /// An OS handle operation failed, e.g. duplicating a dma-buf fd.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver returned a failure this layer cannot locally recover
    /// from. Device loss also surfaces here, on the next call that touches
    /// the lost device.
    #[error("Vulkan call failed: {0}")]
    External(#[from] VulkanError),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        Error::External(VulkanError(result))
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
