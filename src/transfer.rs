//! Host frame transfers.
//!
//! Uploads and downloads move pixel rows between host memory and frame
//! images through one host-visible buffer per plane, submitted on the
//! transfer queue. When the host-import extension is available and a plane's
//! memory satisfies the driver's page rules, the caller's own allocation
//! backs the buffer and the staging copy is skipped entirely.
//!
//! Uploads return as soon as the copy is submitted; the frame's timeline
//! semaphores pace whoever consumes it next. Downloads wait for completion
//! before reading the staging memory back.

use ash::vk;
use smallvec::SmallVec;

use crate::alloc::DeviceMemory;
use crate::device::{Device, HasDevice};
use crate::error::{Error, Result, VulkanError};
use crate::format::PixelFormat;
use crate::frame::{Frame, FramesContext};
use crate::utils::{align_up, AsVkHandle};

/// One source plane of an upload. Rows are ascending; callers with
/// bottom-up layouts flip them before transfer.
pub struct HostPlane<'a> {
    pub data: &'a [u8],
    /// Row stride in bytes.
    pub stride: usize,
}

/// One destination plane of a download.
pub struct HostPlaneMut<'a> {
    pub data: &'a mut [u8],
    pub stride: usize,
}

impl FramesContext {
    /// Uploads host planes into `frame`.
    ///
    /// `width` and `height` are the host image's dimensions and may be
    /// smaller than the frame (padded frames receive only the host extent).
    /// One entry in `planes` per plane of the frame's pixel format.
    pub fn upload(
        &self,
        frame: &Frame,
        width: u32,
        height: u32,
        planes: &[HostPlane<'_>],
    ) -> Result<()> {
        let format = frame.pixel_format();
        check_transfer_args(frame, format, width, height, planes.len())?;
        let device = self.device();
        let limits = device.physical_device().properties().limits;

        let mut bufs: SmallVec<[TransferBuffer; 4]> = SmallVec::new();
        for (i, plane) in planes.iter().enumerate() {
            let extent = format.plane_extent(width, height, i);
            bufs.push(plane_buffer(
                device,
                &limits,
                plane.data.as_ptr(),
                plane.stride as vk::DeviceSize,
                extent.height,
                vk::BufferUsageFlags::TRANSFER_SRC,
            )?);
        }

        // Stage the planes the device cannot read in place.
        for (i, (buf, plane)) in bufs.iter().zip(planes).enumerate() {
            if buf.host_mapped {
                continue;
            }
            let extent = format.plane_extent(width, height, i);
            let byte_width = (buf.stride as usize).min(plane.stride);
            let mut mapped = buf.memory.map()?;
            copy_rows(
                mapped.bytes_mut(),
                buf.stride as usize,
                plane.data,
                plane.stride,
                byte_width,
                extent.height,
            );
            mapped.flush()?;
        }

        self.transfer_image_buf(frame, format, width, height, &mut bufs, true)
    }

    /// Downloads `frame` into host planes. Blocks until the rows are in
    /// place.
    pub fn download(
        &self,
        frame: &Frame,
        width: u32,
        height: u32,
        planes: &mut [HostPlaneMut<'_>],
    ) -> Result<()> {
        let format = frame.pixel_format();
        check_transfer_args(frame, format, width, height, planes.len())?;
        let device = self.device();
        let limits = device.physical_device().properties().limits;

        let mut bufs: SmallVec<[TransferBuffer; 4]> = SmallVec::new();
        for (i, plane) in planes.iter().enumerate() {
            let extent = format.plane_extent(width, height, i);
            bufs.push(plane_buffer(
                device,
                &limits,
                plane.data.as_ptr(),
                plane.stride as vk::DeviceSize,
                extent.height,
                vk::BufferUsageFlags::TRANSFER_DST,
            )?);
        }

        self.transfer_image_buf(frame, format, width, height, &mut bufs, false)?;

        for (i, (buf, plane)) in bufs.iter().zip(planes.iter_mut()).enumerate() {
            if buf.host_mapped {
                continue;
            }
            let extent = format.plane_extent(width, height, i);
            let byte_width = (buf.stride as usize).min(plane.stride);
            let mapped = buf.memory.map()?;
            mapped.invalidate()?;
            copy_rows(
                plane.data,
                plane.stride,
                mapped.bytes(),
                buf.stride as usize,
                byte_width,
                extent.height,
            );
        }
        Ok(())
    }

    /// Records and submits the per-plane copies between `bufs` and the
    /// frame's images. Uploads hand the buffers to the context until its
    /// next reuse; downloads wait for the submission and leave the buffers
    /// with the caller.
    fn transfer_image_buf(
        &self,
        frame: &Frame,
        format: PixelFormat,
        width: u32,
        height: u32,
        bufs: &mut SmallVec<[TransferBuffer; 4]>,
        upload: bool,
    ) -> Result<()> {
        let pool = if upload {
            self.upload_pool()
        } else {
            self.download_pool()
        };
        let mut exec = pool.acquire();
        exec.begin()?;
        let cmd = exec.command_buffer();
        let device = self.device().clone();

        exec.add_frame(
            frame,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::PipelineStageFlags2::TRANSFER,
        );
        let mut barriers = Vec::new();
        exec.frame_barrier(
            frame,
            &mut barriers,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::PipelineStageFlags2::TRANSFER,
            if upload {
                vk::AccessFlags2::TRANSFER_WRITE
            } else {
                vk::AccessFlags2::TRANSFER_READ
            },
            if upload {
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            } else {
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL
            },
            vk::QUEUE_FAMILY_IGNORED,
        );
        exec.emit_barriers(&barriers);
        let copy_layout = barriers[0].new_layout;

        let plane_count = format.plane_count() as usize;
        let image_count = frame.image_count();
        for (i, buf) in bufs.iter().enumerate() {
            let extent = format.plane_extent(width, height, i);
            let idx = i.min(image_count - 1);
            let region = vk::BufferImageCopy {
                buffer_offset: buf.offset,
                buffer_row_length: (buf.stride / vk::DeviceSize::from(format.plane_step(i)))
                    as u32,
                buffer_image_height: extent.height,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: copy_aspect(plane_count, image_count, i),
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            };
            // Safety: the barrier above put the image in `copy_layout` and
            // the buffers were created with the matching transfer usage.
            unsafe {
                if upload {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        buf.buffer,
                        frame.image(idx),
                        copy_layout,
                        &[region],
                    );
                } else {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        frame.image(idx),
                        copy_layout,
                        buf.buffer,
                        &[region],
                    );
                }
            }
        }

        if upload {
            // The context owns the staging until its fence is next waited.
            for buf in bufs.drain(..) {
                exec.retain(buf);
            }
            exec.submit()
        } else {
            exec.submit()?;
            exec.wait_done()
        }
    }
}

/// A host-visible buffer backing one plane of a transfer.
struct TransferBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: DeviceMemory,
    /// Row stride of the buffer contents in bytes.
    stride: vk::DeviceSize,
    /// Offset of the plane's first byte inside the buffer. Nonzero only for
    /// imported host pointers, which get aligned down to a page boundary.
    offset: vk::DeviceSize,
    /// The buffer is the caller's own memory imported in place.
    host_mapped: bool,
}

impl Drop for TransferBuffer {
    fn drop(&mut self) {
        // Safety: transfers either retain the buffer until the next fence
        // wait or wait the fence themselves before dropping it.
        unsafe { self.device.destroy_buffer(self.buffer, None) };
    }
}

/// An importable window over caller memory, aligned down to the device's
/// host pointer alignment.
struct HostImport {
    base: *const std::ffi::c_void,
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
    type_bits: u32,
}

/// Creates the buffer for one plane: the caller's memory imported in place
/// when the device accepts the pointer, a staging buffer otherwise.
fn plane_buffer(
    device: &Device,
    limits: &vk::PhysicalDeviceLimits,
    ptr: *const u8,
    stride: vk::DeviceSize,
    rows: u32,
    usage: vk::BufferUsageFlags,
) -> Result<TransferBuffer> {
    if let Some(import) = probe_host_import(device, ptr, stride, rows) {
        let (buffer, memory) = create_transfer_buffer(
            device,
            import.size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some(&import),
        )?;
        return Ok(TransferBuffer {
            device: device.clone(),
            buffer,
            memory,
            stride,
            offset: import.offset,
            host_mapped: true,
        });
    }

    let (stride, size) = staging_layout(limits, stride, rows);
    let (buffer, memory) = create_transfer_buffer(
        device,
        size,
        usage,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        None,
    )?;
    Ok(TransferBuffer {
        device: device.clone(),
        buffer,
        memory,
        stride,
        offset: 0,
        host_mapped: false,
    })
}

/// Checks whether `ptr` can back a transfer buffer directly. Requires the
/// host-import extension and a driver that reports at least one memory type
/// for the pointer's page range.
fn probe_host_import(
    device: &Device,
    ptr: *const u8,
    stride: vk::DeviceSize,
    rows: u32,
) -> Option<HostImport> {
    let fns = device.host_import_fns()?;
    let alignment = device.physical_device().properties().host_import_alignment()?;
    if stride == 0 {
        return None;
    }
    let (offset, size) = import_window(ptr as u64, alignment, stride, rows);
    let base = ptr.wrapping_sub(offset as usize);
    let mut props = vk::MemoryHostPointerPropertiesEXT::default();
    // Safety: the driver only inspects the page mappings of the range here.
    let ret = unsafe {
        (fns.fp().get_memory_host_pointer_properties_ext)(
            fns.device(),
            vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
            base.cast(),
            &mut props,
        )
        .result()
    };
    match ret {
        Ok(()) if props.memory_type_bits != 0 => Some(HostImport {
            base: base.cast(),
            size,
            offset,
            type_bits: props.memory_type_bits,
        }),
        _ => None,
    }
}

/// The aligned import range for a plane at `addr`: the offset of the first
/// plane byte from the page start and the padded total size.
fn import_window(addr: u64, alignment: u64, stride: u64, rows: u32) -> (u64, u64) {
    let offset = addr % alignment;
    let size = align_up(offset + stride * u64::from(rows), alignment);
    (offset, size)
}

/// Staging layout for one plane: the stride aligned to the device's copy
/// pitch rule and the total size padded so the allocation stays mappable.
fn staging_layout(
    limits: &vk::PhysicalDeviceLimits,
    stride: vk::DeviceSize,
    rows: u32,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let stride = align_up(stride, limits.optimal_buffer_copy_row_pitch_alignment);
    let size = align_up(
        stride * vk::DeviceSize::from(rows),
        limits.min_memory_map_alignment as vk::DeviceSize,
    );
    (stride, size)
}

fn create_transfer_buffer(
    device: &Device,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    flags: vk::MemoryPropertyFlags,
    import: Option<&HostImport>,
) -> Result<(vk::Buffer, DeviceMemory)> {
    let mut external_info = vk::ExternalMemoryBufferCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT);
    let mut info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    if import.is_some() {
        info = info.push_next(&mut external_info);
    }
    // Safety: no host synchronization rules for vkCreateBuffer.
    let buffer = unsafe { device.create_buffer(&info, None) }.map_err(|ret| {
        tracing::error!(result = ?ret, "failed to create transfer buffer");
        VulkanError(ret)
    })?;

    let memory = match alloc_buffer_memory(device, buffer, flags, import) {
        Ok(memory) => memory,
        Err(err) => {
            // Safety: nothing references the fresh buffer.
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(err);
        }
    };
    // Safety: the buffer is fresh and unbound.
    if let Err(ret) = unsafe { device.bind_buffer_memory(buffer, memory.vk_handle(), 0) } {
        // Safety: as above.
        unsafe { device.destroy_buffer(buffer, None) };
        return Err(VulkanError(ret).into());
    }
    Ok((buffer, memory))
}

fn alloc_buffer_memory(
    device: &Device,
    buffer: vk::Buffer,
    flags: vk::MemoryPropertyFlags,
    import: Option<&HostImport>,
) -> Result<DeviceMemory> {
    let mut dedicated_req = vk::MemoryDedicatedRequirements::default();
    let mut reqs2 = vk::MemoryRequirements2::default().push_next(&mut dedicated_req);
    let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
    // Safety: no host synchronization rules.
    unsafe { device.get_buffer_memory_requirements2(&info, &mut reqs2) };
    let mut reqs = reqs2.memory_requirements;
    let dedicated = dedicated_req.prefers_dedicated_allocation != vk::FALSE
        || dedicated_req.requires_dedicated_allocation != vk::FALSE;

    let mut import_info = vk::ImportMemoryHostPointerInfoEXT {
        handle_type: vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
        ..Default::default()
    };
    if let Some(import) = import {
        // Imported memory may only use types the driver reported for the
        // pointer.
        import_info.p_host_pointer = import.base.cast_mut();
        reqs.memory_type_bits &= import.type_bits;
        if reqs.memory_type_bits == 0 {
            return Err(Error::Unsupported(
                "host pointer cannot back a transfer buffer on this device".into(),
            ));
        }
    }
    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().buffer(buffer);
    match (import.is_some(), dedicated) {
        (true, true) => {
            dedicated_info.p_next = <*const _>::cast(&import_info);
            DeviceMemory::alloc(device, &reqs, flags, Some(&mut dedicated_info))
        }
        (true, false) => DeviceMemory::alloc(device, &reqs, flags, Some(&mut import_info)),
        (false, true) => DeviceMemory::alloc(device, &reqs, flags, Some(&mut dedicated_info)),
        (false, false) => DeviceMemory::alloc(device, &reqs, flags, None),
    }
}

fn check_transfer_args(
    frame: &Frame,
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: usize,
) -> Result<()> {
    if width == 0 || height == 0 || width > frame.width() || height > frame.height() {
        return Err(Error::Unsupported(format!(
            "host extent {}x{} does not fit a {}x{} frame",
            width,
            height,
            frame.width(),
            frame.height()
        )));
    }
    let expected = format.plane_count() as usize;
    if planes != expected {
        return Err(Error::Unsupported(format!(
            "{format:?} transfers take {expected} planes, got {planes}"
        )));
    }
    Ok(())
}

/// Aspect a plane copy targets: the whole image when every plane has its
/// own, the matching plane aspect of a combined multiplanar image otherwise.
pub(crate) fn copy_aspect(planes: usize, images: usize, plane: usize) -> vk::ImageAspectFlags {
    if planes == images {
        vk::ImageAspectFlags::COLOR
    } else {
        match plane {
            0 => vk::ImageAspectFlags::PLANE_0,
            1 => vk::ImageAspectFlags::PLANE_1,
            _ => vk::ImageAspectFlags::PLANE_2,
        }
    }
}

/// Copies `rows` rows of `byte_width` bytes between differently strided
/// planes, clamping at slice ends so short final rows stay in bounds.
fn copy_rows(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    byte_width: usize,
    rows: u32,
) {
    for row in 0..rows as usize {
        let s = row * src_stride;
        let d = row * dst_stride;
        let len = byte_width
            .min(src.len().saturating_sub(s))
            .min(dst.len().saturating_sub(d));
        if len == 0 {
            break;
        }
        dst[d..d + len].copy_from_slice(&src[s..s + len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(pitch: u64, map: usize) -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            optimal_buffer_copy_row_pitch_alignment: pitch,
            min_memory_map_alignment: map,
            ..Default::default()
        }
    }

    #[test]
    fn staging_layout_aligns_stride_then_size() {
        let (stride, size) = staging_layout(&limits(64, 4096), 1920, 1080);
        assert_eq!(stride, 1920);
        assert_eq!(size, align_up(1920 * 1080, 4096));

        let (stride, size) = staging_layout(&limits(64, 4096), 1900, 10);
        assert_eq!(stride, 1920);
        assert_eq!(size, align_up(1920 * 10, 4096));
    }

    #[test]
    fn import_window_covers_the_leading_pad() {
        let (offset, size) = import_window(0x1000, 0x1000, 640, 480);
        assert_eq!(offset, 0);
        assert_eq!(size, align_up(640 * 480, 0x1000));

        let (offset, size) = import_window(0x1070, 0x1000, 640, 480);
        assert_eq!(offset, 0x70);
        assert_eq!(size, align_up(0x70 + 640 * 480, 0x1000));
    }

    #[test]
    fn copy_aspect_splits_only_combined_images() {
        // One image per plane: plain color copies.
        assert_eq!(copy_aspect(2, 2, 1), vk::ImageAspectFlags::COLOR);
        // Two planes in one image: plane aspects.
        assert_eq!(copy_aspect(2, 1, 0), vk::ImageAspectFlags::PLANE_0);
        assert_eq!(copy_aspect(2, 1, 1), vk::ImageAspectFlags::PLANE_1);
        assert_eq!(copy_aspect(3, 1, 2), vk::ImageAspectFlags::PLANE_2);
    }

    #[test]
    fn copy_rows_restrides() {
        let src = [1u8, 2, 3, 0, 4, 5, 6, 0];
        let mut dst = [0u8; 12];
        copy_rows(&mut dst, 6, &src, 4, 3, 2);
        assert_eq!(dst, [1, 2, 3, 0, 0, 0, 4, 5, 6, 0, 0, 0]);
    }

    #[test]
    fn copy_rows_clamps_short_final_row() {
        // Source holds two rows at stride 4 but the last row is cut to 2
        // bytes; the copy must not read past it.
        let src = [9u8, 8, 7, 0, 5, 4];
        let mut dst = [0u8; 8];
        copy_rows(&mut dst, 4, &src, 4, 3, 2);
        assert_eq!(dst, [9, 8, 7, 0, 5, 4, 0, 0]);
    }
}
