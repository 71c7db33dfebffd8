//! Device memory allocation.
//!
//! The memory type table is required by the API to be ordered best-first, so
//! selection is a single first-fit scan: the requirement bitmask is a hard
//! filter, the requested property flags must be a subset of the type's flags,
//! and the backing heap must be large enough. The flags the chosen type
//! actually carries are kept on the allocation so later code can test for
//! coherence or cached access it never asked for.

use std::fmt::Debug;

use ash::vk;

use crate::device::{Device, HasDevice};
use crate::error::{Error, Result, VulkanError};
use crate::utils::{align_up, AsVkHandle};

/// Finds the first memory type compatible with `requirements` and carrying
/// every bit of `required_flags`.
///
/// Returns the type index and the type's full property flags.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: &vk::MemoryRequirements,
    required_flags: vk::MemoryPropertyFlags,
) -> Result<(u32, vk::MemoryPropertyFlags)> {
    let types = &memory_properties.memory_types[..memory_properties.memory_type_count as usize];
    for (i, memory_type) in types.iter().enumerate() {
        if requirements.memory_type_bits & (1 << i) == 0 {
            continue;
        }
        if !memory_type.property_flags.contains(required_flags) {
            continue;
        }
        let heap = &memory_properties.memory_heaps[memory_type.heap_index as usize];
        if requirements.size > heap.size {
            continue;
        }
        return Ok((i as u32, memory_type.property_flags));
    }
    tracing::error!(flags = ?required_flags, "no memory type found");
    Err(Error::NoSuitableType(required_flags))
}

/// An owned device memory allocation, freed on drop.
pub struct DeviceMemory {
    device: Device,
    handle: vk::DeviceMemory,
    size: vk::DeviceSize,
    flags: vk::MemoryPropertyFlags,
}

impl DeviceMemory {
    /// Allocates memory satisfying `requirements` with at least
    /// `required_flags`.
    ///
    /// Host-visible requests have their size aligned up to the device's map
    /// alignment first, so the whole allocation can always be mapped.
    /// `alloc_next` carries dedicated/export/import chains when the caller
    /// needs them.
    pub fn alloc(
        device: &Device,
        requirements: &vk::MemoryRequirements,
        required_flags: vk::MemoryPropertyFlags,
        alloc_next: Option<&mut dyn vk::ExtendsMemoryAllocateInfo>,
    ) -> Result<DeviceMemory> {
        let properties = device.physical_device().properties();
        let mut size = requirements.size;
        if required_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            size = align_up(size, properties.limits.min_memory_map_alignment as u64);
        }
        let adjusted = vk::MemoryRequirements {
            size,
            ..*requirements
        };
        let (type_index, type_flags) =
            find_memory_type(properties.memory_properties(), &adjusted, required_flags)?;

        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        if let Some(next) = alloc_next {
            info = info.push_next(next);
        }
        // Safety: no host synchronization rules for vkAllocateMemory.
        let handle = unsafe { device.allocate_memory(&info, None) }.map_err(|ret| {
            tracing::error!(result = ?ret, "failed to allocate memory");
            Error::OutOfMemory(VulkanError(ret))
        })?;
        Ok(DeviceMemory {
            device: device.clone(),
            handle,
            size,
            flags: type_flags,
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// The full property flags of the chosen memory type, a superset of what
    /// was requested.
    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.flags
    }

    pub fn is_host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Maps the whole allocation.
    pub fn map(&self) -> Result<MappedMemory<'_>> {
        debug_assert!(self.is_host_visible());
        // Safety: host access to the memory is exclusive to this wrapper and
        // map() takes &self only for host-visible allocations.
        let ptr = unsafe {
            self.device
                .map_memory(self.handle, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .map_err(VulkanError)?;
        Ok(MappedMemory {
            memory: self,
            ptr: ptr.cast(),
        })
    }
}

impl HasDevice for DeviceMemory {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for DeviceMemory {
    type Handle = vk::DeviceMemory;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        tracing::trace!(memory = ?self.handle, size = self.size, "free memory");
        // Safety: exclusive ownership; mapped views borrow the wrapper and
        // cannot outlive it.
        unsafe { self.device.free_memory(self.handle, None) };
    }
}

/// A mapped view of a host-visible allocation, unmapped on drop.
pub struct MappedMemory<'a> {
    memory: &'a DeviceMemory,
    ptr: *mut u8,
}

impl MappedMemory<'_> {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: the mapping covers the whole aligned allocation.
        unsafe { std::slice::from_raw_parts(self.ptr, self.memory.size as usize) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.memory.size as usize) }
    }

    /// Makes host writes visible to the device. No-op for coherent memory.
    pub fn flush(&self) -> Result<()> {
        if self
            .memory
            .flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let range = vk::MappedMemoryRange::default()
            .memory(self.memory.handle)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        // Safety: the range covers a currently mapped allocation.
        unsafe { self.memory.device.flush_mapped_memory_ranges(&[range]) }?;
        Ok(())
    }

    /// Makes device writes visible to the host. No-op for coherent memory.
    pub fn invalidate(&self) -> Result<()> {
        if self
            .memory
            .flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let range = vk::MappedMemoryRange::default()
            .memory(self.memory.handle)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        // Safety: the range covers a currently mapped allocation.
        unsafe { self.memory.device.invalidate_mapped_memory_ranges(&[range]) }?;
        Ok(())
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        // Safety: the memory is mapped exactly once per wrapper.
        unsafe { self.memory.device.unmap_memory(self.memory.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(
        types: &[(u32, vk::MemoryPropertyFlags)],
        heaps: &[u64],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: heaps.len() as u32,
            ..Default::default()
        };
        for (i, &(heap_index, property_flags)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index,
            };
        }
        for (i, &size) in heaps.iter().enumerate() {
            props.memory_heaps[i].size = size;
        }
        props
    }

    fn req(size: u64, memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment: 0,
            memory_type_bits,
        }
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;

    #[test]
    fn first_fit_prefers_the_lowest_index() {
        let props = table(&[(0, DEVICE_LOCAL), (0, DEVICE_LOCAL)], &[1 << 30]);
        let (index, _) = find_memory_type(&props, &req(4096, 0b11), DEVICE_LOCAL).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn requirement_mask_is_a_hard_filter() {
        let props = table(
            &[
                (0, DEVICE_LOCAL),
                (0, DEVICE_LOCAL),
                (0, DEVICE_LOCAL),
                (0, DEVICE_LOCAL),
            ],
            &[1 << 30],
        );
        // Only type 2 is allowed by the image's requirement bits.
        let (index, _) = find_memory_type(&props, &req(4096, 0b0100), DEVICE_LOCAL).unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn property_flags_must_be_a_superset() {
        let wanted = HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let full = wanted | vk::MemoryPropertyFlags::HOST_CACHED;
        let props = table(&[(0, HOST_VISIBLE), (0, full)], &[1 << 30]);
        let (index, achieved) = find_memory_type(&props, &req(4096, 0b11), wanted).unwrap();
        assert_eq!(index, 1);
        // The type's extra flags come back so callers can skip flushes.
        assert_eq!(achieved, full);
    }

    #[test]
    fn heap_size_is_checked() {
        let props = table(&[(0, DEVICE_LOCAL), (1, DEVICE_LOCAL)], &[1024, 1 << 30]);
        let (index, _) = find_memory_type(&props, &req(4096, 0b11), DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn no_match_is_an_error() {
        let props = table(&[(0, DEVICE_LOCAL)], &[1 << 30]);
        let err = find_memory_type(&props, &req(4096, 0b1), HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, Error::NoSuitableType(flags) if flags == HOST_VISIBLE));
    }
}
