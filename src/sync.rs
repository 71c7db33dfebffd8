//! GPU synchronization primitives.
//!
//! Every frame image carries one timeline [`Semaphore`]; per-image progress
//! is the pair (semaphore, counter value) recorded in the frame's state.
//! Execution contexts pace themselves with a [`Fence`] that starts signaled
//! so the first reuse never blocks.

use std::fmt::Debug;

use ash::vk;

use crate::device::{Device, HasDevice};
use crate::error::{Result, VulkanError};
use crate::utils::AsVkHandle;

/// The handle type used when a semaphore is created exportable.
#[cfg(unix)]
pub const EXPORTABLE_SEMAPHORE_HANDLE_TYPE: vk::ExternalSemaphoreHandleTypeFlags =
    vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD;
#[cfg(windows)]
pub const EXPORTABLE_SEMAPHORE_HANDLE_TYPE: vk::ExternalSemaphoreHandleTypeFlags =
    vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32;

/// A timeline semaphore.
pub struct Semaphore {
    device: Device,
    handle: vk::Semaphore,
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.handle).finish()
    }
}

impl Semaphore {
    /// Creates a timeline semaphore starting at `initial_value`.
    pub fn new(device: Device, initial_value: u64) -> Result<Self> {
        Self::create(device, initial_value, false)
    }

    /// Creates a timeline semaphore whose handle can be exported to other
    /// APIs. The external-semaphore device extension must be enabled.
    pub fn new_exportable(device: Device, initial_value: u64) -> Result<Self> {
        Self::create(device, initial_value, true)
    }

    fn create(device: Device, initial_value: u64, exportable: bool) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value,
            ..Default::default()
        };
        let mut export_info = vk::ExportSemaphoreCreateInfo {
            handle_types: EXPORTABLE_SEMAPHORE_HANDLE_TYPE,
            ..Default::default()
        };
        let mut info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        if exportable {
            info = info.push_next(&mut export_info);
        }
        // Safety: no host synchronization rules for vkCreateSemaphore.
        let handle = unsafe { device.create_semaphore(&info, None) }.map_err(|ret| {
            tracing::error!(result = ?ret, "failed to create semaphore");
            VulkanError(ret)
        })?;
        Ok(Self { device, handle })
    }

    /// Queries the current counter from the device.
    pub fn counter_value(&self) -> Result<u64> {
        // Safety: no host synchronization rules.
        let value =
            unsafe { self.device.get_semaphore_counter_value(self.handle) }.map_err(VulkanError)?;
        Ok(value)
    }

    /// Blocks until the counter reaches `value` or the timeout expires.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<()> {
        let info = vk::SemaphoreWaitInfo {
            semaphore_count: 1,
            p_semaphores: &self.handle,
            p_values: &value,
            ..Default::default()
        };
        // Safety: the info points at locals that outlive the call.
        unsafe { self.device.wait_semaphores(&info, timeout_ns) }.map_err(VulkanError)?;
        Ok(())
    }

    /// Signals the counter to `value` from the host.
    pub fn signal(&self, value: u64) -> Result<()> {
        let info = vk::SemaphoreSignalInfo {
            semaphore: self.handle,
            value,
            ..Default::default()
        };
        // Safety: no host synchronization rules for vkSignalSemaphore.
        unsafe { self.device.signal_semaphore(&info) }.map_err(VulkanError)?;
        Ok(())
    }
}

impl HasDevice for Semaphore {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Semaphore {
    type Handle = vk::Semaphore;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::trace!(semaphore = ?self.handle, "drop semaphore");
        // Safety: owners wait out pending GPU signals before dropping.
        unsafe { self.device.destroy_semaphore(self.handle, None) };
    }
}

/// A fence paced the way execution contexts reuse them: created signaled,
/// waited and reset before each recording.
pub struct Fence {
    device: Device,
    handle: vk::Fence,
}

impl Fence {
    pub fn new_signaled(device: Device) -> Result<Self> {
        let info = vk::FenceCreateInfo {
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        // Safety: no host synchronization rules for vkCreateFence.
        let handle = unsafe { device.create_fence(&info, None) }.map_err(VulkanError)?;
        Ok(Self { device, handle })
    }

    /// Blocks until signaled. The fence stays signaled afterwards.
    pub fn wait(&self) -> Result<()> {
        // Safety: no host synchronization rules for vkWaitForFences.
        unsafe {
            self.device
                .wait_for_fences(&[self.handle], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Resets to unsignaled for the next submission.
    pub fn reset(&self) -> Result<()> {
        // Safety: each context owns its fence exclusively, so no concurrent
        // reset can race this one.
        unsafe { self.device.reset_fences(&[self.handle])? };
        Ok(())
    }

    /// Blocks until signaled, then resets for the next submission.
    pub fn wait_and_reset(&self) -> Result<()> {
        self.wait()?;
        self.reset()
    }

    pub fn is_signaled(&self) -> Result<bool> {
        // Safety: no host synchronization rules.
        let signaled = unsafe { self.device.get_fence_status(self.handle) }.map_err(VulkanError)?;
        Ok(signaled)
    }
}

impl HasDevice for Fence {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Fence {
    type Handle = vk::Fence;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // Safety: owners wait the fence before dropping.
        unsafe { self.device.destroy_fence(self.handle, None) };
    }
}
