//! DRM PRIME dma-buf import and export.
//!
//! A PRIME descriptor is a set of dma-buf objects plus layers describing how
//! sub-images sit inside them. Import wraps each layer in an image with
//! explicit DRM-modifier subresource layouts and binds duplicated,
//! imported fds, so the caller keeps its own descriptor alive however it
//! likes. Export walks the other way: it releases the frame, reads the
//! modifier and per-plane layouts back from the driver and hands out fresh
//! fds that own references to the frame's allocations.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};

use ash::vk;
use smallvec::SmallVec;

use crate::alloc::DeviceMemory;
use crate::device::{Device, HasDevice};
use crate::error::{Error, Result, VulkanError};
use crate::exec::{prepare_frame, PrepMode};
use crate::format;
use crate::frame::{destroy_images, image_memory_requirements, Frame, FramesContext};
use crate::sync::Semaphore;
use crate::transfer::copy_aspect;
use crate::utils::{AsVkHandle, SharingMode};

/// Descriptor shape cap, matching the four planes a format can have.
const MAX_DRM_PLANES: usize = 4;

/// Image usage every imported frame gets. Imports are source material;
/// writing back into foreign memory is out of scope.
const IMPORT_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::SAMPLED.as_raw() | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
);

const fn fourcc(code: [u8; 4]) -> u32 {
    (code[0] as u32)
        | (code[1] as u32) << 8
        | (code[2] as u32) << 16
        | (code[3] as u32) << 24
}

const DRM_FORMAT_R8: u32 = fourcc(*b"R8  ");
const DRM_FORMAT_R16: u32 = fourcc(*b"R16 ");
const DRM_FORMAT_GR88: u32 = fourcc(*b"GR88");
const DRM_FORMAT_RG88: u32 = fourcc(*b"RG88");
const DRM_FORMAT_GR1616: u32 = fourcc(*b"GR32");
const DRM_FORMAT_RG1616: u32 = fourcc(*b"RG32");
const DRM_FORMAT_ARGB8888: u32 = fourcc(*b"AR24");
const DRM_FORMAT_XRGB8888: u32 = fourcc(*b"XR24");
const DRM_FORMAT_ABGR8888: u32 = fourcc(*b"AB24");
const DRM_FORMAT_XBGR8888: u32 = fourcc(*b"XB24");
const DRM_FORMAT_XYUV8888: u32 = fourcc(*b"XYUV");
const DRM_FORMAT_XVYU12_16161616: u32 = fourcc(*b"XV36");
const DRM_FORMAT_Y416: u32 = fourcc(*b"Y416");

/// DRM format ↔ image format pairs accepted for PRIME layers. Lookups in
/// either direction take the first match, so the preferred fourcc of an
/// ambiguous image format comes first.
static DRM_FORMAT_MAP: &[(u32, vk::Format)] = &[
    (DRM_FORMAT_R8, vk::Format::R8_UNORM),
    (DRM_FORMAT_R16, vk::Format::R16_UNORM),
    (DRM_FORMAT_GR88, vk::Format::R8G8_UNORM),
    (DRM_FORMAT_RG88, vk::Format::R8G8_UNORM),
    (DRM_FORMAT_GR1616, vk::Format::R16G16_UNORM),
    (DRM_FORMAT_RG1616, vk::Format::R16G16_UNORM),
    (DRM_FORMAT_ARGB8888, vk::Format::B8G8R8A8_UNORM),
    (DRM_FORMAT_XRGB8888, vk::Format::B8G8R8A8_UNORM),
    (DRM_FORMAT_ABGR8888, vk::Format::R8G8B8A8_UNORM),
    (DRM_FORMAT_XBGR8888, vk::Format::R8G8B8A8_UNORM),
    (DRM_FORMAT_XYUV8888, vk::Format::R8G8B8A8_UNORM),
    (DRM_FORMAT_XVYU12_16161616, vk::Format::R16G16B16A16_UNORM),
    (DRM_FORMAT_Y416, vk::Format::R16G16B16A16_UNORM),
];

fn drm_to_vk(fourcc: u32) -> Option<vk::Format> {
    DRM_FORMAT_MAP
        .iter()
        .find(|&&(drm, _)| drm == fourcc)
        .map(|&(_, format)| format)
}

fn vk_to_drm(format: vk::Format) -> Option<u32> {
    DRM_FORMAT_MAP
        .iter()
        .find(|&&(_, vk)| vk == format)
        .map(|&(drm, _)| drm)
}

/// One dma-buf backing object of a descriptor to import. Borrows the fd;
/// import duplicates it and never takes ownership of the original.
#[derive(Debug)]
pub struct DrmObject<'a> {
    pub fd: BorrowedFd<'a>,
    pub size: u64,
    pub format_modifier: u64,
}

/// One plane of a layer: where its rows live in the backing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrmPlane {
    pub object_index: usize,
    pub offset: u64,
    pub pitch: u64,
}

/// One layer of a descriptor: a single-format sub-image.
#[derive(Clone, Debug)]
pub struct DrmLayer {
    pub fourcc: u32,
    pub planes: Vec<DrmPlane>,
}

/// A DRM PRIME frame descriptor to import.
#[derive(Debug)]
pub struct DrmDescriptor<'a> {
    pub objects: Vec<DrmObject<'a>>,
    pub layers: Vec<DrmLayer>,
}

/// One exported backing object. The fd is owned and keeps its allocation
/// alive independently of the frame.
#[derive(Debug)]
pub struct DrmExportObject {
    pub fd: OwnedFd,
    pub size: u64,
    pub format_modifier: u64,
}

/// An exported PRIME descriptor.
#[derive(Debug)]
pub struct DrmExport {
    pub objects: Vec<DrmExportObject>,
    pub layers: Vec<DrmLayer>,
}

/// Checks descriptor shape and resolves every layer format, before any
/// handle is touched.
fn validate_layers(
    layers: &[DrmLayer],
    object_count: usize,
    plane_count: usize,
) -> Result<SmallVec<[vk::Format; 4]>> {
    if layers.len() != plane_count || layers.len() > MAX_DRM_PLANES {
        return Err(Error::Unsupported(format!(
            "{} descriptor layers cannot represent a {plane_count}-plane format",
            layers.len()
        )));
    }
    let mut formats = SmallVec::new();
    for layer in layers {
        if layer.planes.is_empty() || layer.planes.len() > MAX_DRM_PLANES {
            return Err(Error::Unsupported(format!(
                "layer has {} planes, expected 1 to {MAX_DRM_PLANES}",
                layer.planes.len()
            )));
        }
        for plane in &layer.planes {
            if plane.object_index >= object_count {
                return Err(Error::Unsupported(format!(
                    "plane references object {} of {object_count}",
                    plane.object_index
                )));
            }
        }
        let format = drm_to_vk(layer.fourcc).ok_or_else(|| {
            Error::Unsupported(format!(
                "no image format for DRM format {:#010x}",
                layer.fourcc
            ))
        })?;
        formats.push(format);
    }
    Ok(formats)
}

fn memory_plane_aspect(plane: usize) -> vk::ImageAspectFlags {
    match plane {
        0 => vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
        1 => vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
        _ => vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
    }
}

/// Creates one image wrapping a layer's explicit subresource layouts.
///
/// The modifier/format pair is probed first; creating an image the device
/// cannot represent is not a recoverable failure.
fn create_layer_image(
    device: &Device,
    extent: vk::Extent2D,
    layer: &DrmLayer,
    layer_format: vk::Format,
    modifier: u64,
    sharing: &SharingMode<&[u32]>,
) -> Result<vk::Image> {
    let mut external_props = vk::ExternalImageFormatProperties::default();
    let mut props = vk::ImageFormatProperties2::default().push_next(&mut external_props);
    let mut external_query = vk::PhysicalDeviceExternalImageFormatInfo::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let mut modifier_query = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT {
        drm_format_modifier: modifier,
        sharing_mode: sharing.as_raw(),
        ..Default::default()
    }
    .queue_family_indices(sharing.queue_family_indices());
    let query = vk::PhysicalDeviceImageFormatInfo2::default()
        .format(layer_format)
        .ty(vk::ImageType::TYPE_2D)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(IMPORT_USAGE)
        .push_next(&mut external_query)
        .push_next(&mut modifier_query);
    match device
        .physical_device()
        .image_format_properties(&query, &mut props)
    {
        Ok(true) => {}
        Ok(false) => {
            return Err(Error::Unsupported(format!(
                "format {layer_format:?} with modifier {modifier:#x} cannot be imported"
            )))
        }
        Err(err) => return Err(err),
    }

    let layouts: SmallVec<[vk::SubresourceLayout; 4]> = layer
        .planes
        .iter()
        .map(|plane| vk::SubresourceLayout {
            offset: plane.offset,
            row_pitch: plane.pitch,
            // The driver derives the rest from the modifier.
            size: 0,
            array_pitch: 0,
            depth_pitch: 0,
        })
        .collect();
    let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
        .drm_format_modifier(modifier)
        .plane_layouts(&layouts);
    let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let info = vk::ImageCreateInfo {
        image_type: vk::ImageType::TYPE_2D,
        format: layer_format,
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: 1,
        flags: vk::ImageCreateFlags::empty(),
        tiling: vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
        initial_layout: vk::ImageLayout::UNDEFINED,
        usage: IMPORT_USAGE,
        samples: vk::SampleCountFlags::TYPE_1,
        sharing_mode: sharing.as_raw(),
        ..Default::default()
    }
    .queue_family_indices(sharing.queue_family_indices())
    .push_next(&mut external_info)
    .push_next(&mut modifier_info);
    // Safety: no host synchronization rules for vkCreateImage.
    unsafe { device.create_image(&info, None) }.map_err(|ret| {
        tracing::error!(result = ?ret, format = ?layer_format, "failed to create imported image");
        VulkanError(ret).into()
    })
}

/// Imports the dma-buf backing one layer.
///
/// The fd is duplicated so the descriptor keeps its own; a successful
/// allocation consumes the duplicate, a failed one closes it.
fn import_layer_memory(
    device: &Device,
    fd_fns: &ash::khr::external_memory_fd::Device,
    image: vk::Image,
    object_fd: BorrowedFd<'_>,
) -> Result<DeviceMemory> {
    let fd = object_fd.try_clone_to_owned()?;
    let mut fd_props = vk::MemoryFdPropertiesKHR::default();
    // Safety: the fd is a valid dma-buf handle owned by this function.
    if let Err(ret) = unsafe {
        fd_fns.get_memory_fd_properties(
            vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
            fd.as_raw_fd(),
            &mut fd_props,
        )
    } {
        tracing::error!(result = ?ret, "failed to query dma-buf memory types");
        return Err(VulkanError(ret).into());
    }

    let (mut reqs, dedicated) = image_memory_requirements(device, image);
    reqs.memory_type_bits &= fd_props.memory_type_bits;
    if reqs.memory_type_bits == 0 {
        return Err(Error::Unsupported(
            "dma-buf memory types do not overlap the image requirement".into(),
        ));
    }

    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(fd.as_raw_fd());
    let memory = if dedicated {
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
        dedicated_info.p_next = <*const _>::cast(&import_info);
        DeviceMemory::alloc(
            device,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(&mut dedicated_info),
        )
    } else {
        DeviceMemory::alloc(
            device,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(&mut import_info),
        )
    }?;
    // The import took ownership of the duplicate.
    let _ = fd.into_raw_fd();
    Ok(memory)
}

impl FramesContext {
    /// Imports a DRM PRIME descriptor as a frame of this context's format
    /// and geometry.
    ///
    /// Every layer becomes one image wrapping the descriptor's explicit
    /// subresource layouts, backed by a duplicated, imported dma-buf fd;
    /// the caller's descriptor stays untouched. The frame gets fresh
    /// semaphores: a descriptor carries no sync primitive, so the acquire
    /// barrier submitted here is their first signal and nothing ever waits
    /// for an importer.
    pub fn import_drm(&self, desc: &DrmDescriptor<'_>) -> Result<Frame> {
        let device = self.device().clone();
        if device.drm_modifier_fns().is_none() {
            return Err(Error::MissingRequiredFeature(
                "VK_EXT_image_drm_format_modifier",
            ));
        }
        let fd_fns = device
            .memory_fd_fns()
            .ok_or(Error::MissingRequiredFeature("VK_KHR_external_memory_fd"))?;
        if !device.extension_enabled(ash::ext::external_memory_dma_buf::NAME) {
            return Err(Error::MissingRequiredFeature(
                "VK_EXT_external_memory_dma_buf",
            ));
        }
        if desc.objects.is_empty() {
            return Err(Error::Unsupported("descriptor has no objects".into()));
        }

        let pixfmt = self.pixel_format();
        let layer_formats = validate_layers(
            &desc.layers,
            desc.objects.len(),
            pixfmt.plane_count() as usize,
        )?;
        let modifier = desc.objects[0].format_modifier;

        let families = self.sharing_families();
        let sharing: SharingMode<&[u32]> = if families.len() > 1 {
            SharingMode::Concurrent {
                queue_family_indices: families,
            }
        } else {
            SharingMode::Exclusive
        };

        let mut images: SmallVec<[vk::Image; 4]> = SmallVec::new();
        let mut semaphores: SmallVec<[Semaphore; 4]> = SmallVec::new();
        for (i, (layer, &layer_format)) in desc.layers.iter().zip(&layer_formats).enumerate() {
            let extent = pixfmt.plane_extent(self.width(), self.height(), i);
            let image =
                match create_layer_image(&device, extent, layer, layer_format, modifier, &sharing)
                {
                    Ok(image) => image,
                    Err(err) => {
                        destroy_images(&device, &images);
                        return Err(err);
                    }
                };
            images.push(image);
            match Semaphore::new(device.clone(), 0) {
                Ok(semaphore) => semaphores.push(semaphore),
                Err(err) => {
                    destroy_images(&device, &images);
                    return Err(err);
                }
            }
        }

        let mut memories: SmallVec<[DeviceMemory; 4]> = SmallVec::new();
        for (i, layer) in desc.layers.iter().enumerate() {
            let object = &desc.objects[layer.planes[0].object_index];
            match import_layer_memory(&device, fd_fns, images[i], object.fd) {
                Ok(memory) => memories.push(memory),
                Err(err) => {
                    destroy_images(&device, &images);
                    return Err(err);
                }
            }
        }

        // One bind per memory plane, all in one call.
        let plane_total = desc.layers.iter().map(|l| l.planes.len()).sum();
        let mut plane_infos: Vec<vk::BindImagePlaneMemoryInfo<'static>> =
            Vec::with_capacity(plane_total);
        for layer in &desc.layers {
            for (j, _) in layer.planes.iter().enumerate() {
                plane_infos
                    .push(vk::BindImagePlaneMemoryInfo::default().plane_aspect(memory_plane_aspect(j)));
            }
        }
        let mut bind_infos: Vec<vk::BindImageMemoryInfo<'static>> =
            Vec::with_capacity(plane_total);
        let mut next_plane = 0;
        for (i, layer) in desc.layers.iter().enumerate() {
            for _ in &layer.planes {
                let mut info = vk::BindImageMemoryInfo {
                    image: images[i],
                    memory: memories[i].vk_handle(),
                    // Plane offsets ride in the explicit layouts.
                    memory_offset: 0,
                    ..Default::default()
                };
                if layer.planes.len() > 1 {
                    info.p_next = <*const _>::cast(&plane_infos[next_plane]);
                }
                bind_infos.push(info);
                next_plane += 1;
            }
        }
        // Safety: the images are fresh and unbound; the bind infos and their
        // chained plane infos outlive the call.
        if let Err(ret) = unsafe { device.bind_image_memory2(&bind_infos) } {
            tracing::error!(result = ?ret, "failed to bind imported memory");
            destroy_images(&device, &images);
            return Err(VulkanError(ret).into());
        }

        let frame = self.adopt_imported(
            images,
            memories,
            semaphores,
            vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            IMPORT_USAGE,
        );
        prepare_frame(self.compute_pool(), &frame, PrepMode::ExternalImport)?;
        tracing::debug!(
            layers = desc.layers.len(),
            modifier = format_args!("{modifier:#x}"),
            "imported dma-buf frame"
        );
        Ok(frame)
    }

    /// Exports `frame` as a DRM PRIME descriptor.
    ///
    /// The frame is released to external ownership and all of its timelines
    /// are host-waited first: a descriptor carries no sync primitive, so the
    /// handoff must be complete before it leaves. The exported fds own
    /// references to the frame's allocations and outlive the frame.
    pub fn export_drm(&self, frame: &Frame) -> Result<DrmExport> {
        let device = self.device();
        let modifier_fns = device.drm_modifier_fns().ok_or(Error::MissingRequiredFeature(
            "VK_EXT_image_drm_format_modifier",
        ))?;
        let fd_fns = device
            .memory_fd_fns()
            .ok_or(Error::MissingRequiredFeature("VK_KHR_external_memory_fd"))?;
        if !self
            .alloc_export_types()
            .contains(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        {
            return Err(Error::Unsupported(
                "frame memory does not export dma-buf handles".into(),
            ));
        }

        prepare_frame(self.compute_pool(), frame, PrepMode::ExternalExport)?;

        // Wait out the release barrier on the host.
        let semaphores: SmallVec<[vk::Semaphore; 4]> = (0..frame.image_count())
            .map(|i| frame.semaphore(i).vk_handle())
            .collect();
        let values: SmallVec<[u64; 4]> = frame.states().iter().map(|s| s.sem_value).collect();
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        // Safety: no host synchronization rules for vkWaitSemaphores.
        unsafe { device.wait_semaphores(&wait_info, u64::MAX) }.map_err(VulkanError)?;

        let mut modifier_props = vk::ImageDrmFormatModifierPropertiesEXT::default();
        // Safety: the image is alive for the duration of the call.
        unsafe {
            modifier_fns.get_image_drm_format_modifier_properties(frame.image(0), &mut modifier_props)
        }
        .map_err(|ret| {
            tracing::error!(result = ?ret, "failed to read the image format modifier");
            VulkanError(ret)
        })?;
        let modifier = modifier_props.drm_format_modifier;

        let object_count = if frame.memory().is_contiguous() {
            1
        } else {
            frame.image_count()
        };
        let mut objects = Vec::with_capacity(object_count);
        for i in 0..object_count {
            let info = vk::MemoryGetFdInfoKHR::default()
                .memory(frame.memory().handle(i))
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
            // Safety: the memory was allocated exportable as dma-buf,
            // checked above.
            let fd = unsafe { fd_fns.get_memory_fd(&info) }.map_err(|ret| {
                tracing::error!(result = ?ret, "failed to export memory as dma-buf");
                VulkanError(ret)
            })?;
            objects.push(DrmExportObject {
                // Safety: a successful export hands a fresh fd to the caller.
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
                size: frame.memory().object_size(i),
                format_modifier: modifier,
            });
        }

        let pixfmt = frame.pixel_format();
        let entry = format::lookup(pixfmt)
            .ok_or_else(|| Error::Unsupported(format!("unknown pixel format {pixfmt:?}")))?;
        let planes = pixfmt.plane_count() as usize;
        let mut layers = Vec::with_capacity(planes);
        for plane in 0..planes {
            let plane_format = entry.fallback[plane.min(entry.fallback.len() - 1)];
            let layer_fourcc = vk_to_drm(plane_format).ok_or_else(|| {
                Error::Unsupported(format!("no DRM format for plane format {plane_format:?}"))
            })?;
            let image = plane.min(frame.image_count() - 1);
            let mut layer_plane = DrmPlane {
                object_index: plane.min(objects.len() - 1),
                offset: 0,
                pitch: 0,
            };
            // Optimal tiling has no meaningful host layout; consumers go by
            // the modifier alone.
            if frame.tiling() != vk::ImageTiling::OPTIMAL {
                let aspect = if frame.tiling() == vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT {
                    if planes == frame.image_count() {
                        vk::ImageAspectFlags::MEMORY_PLANE_0_EXT
                    } else {
                        memory_plane_aspect(plane)
                    }
                } else {
                    copy_aspect(planes, frame.image_count(), plane)
                };
                let subresource = vk::ImageSubresource {
                    aspect_mask: aspect,
                    mip_level: 0,
                    array_layer: 0,
                };
                // Safety: the image uses non-optimal tiling, which keeps its
                // subresource layout host-queryable.
                let layout =
                    unsafe { device.get_image_subresource_layout(frame.image(image), subresource) };
                layer_plane.offset = layout.offset;
                layer_plane.pitch = layout.row_pitch;
                if frame.memory().is_contiguous() {
                    layer_plane.offset += frame.memory().offset(image);
                }
            }
            layers.push(DrmLayer {
                fourcc: layer_fourcc,
                planes: vec![layer_plane],
            });
        }

        tracing::debug!(
            modifier = format_args!("{modifier:#x}"),
            objects = objects.len(),
            layers = layers.len(),
            "exported frame as dma-buf"
        );
        Ok(DrmExport { objects, layers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_pack_little_endian() {
        assert_eq!(DRM_FORMAT_R8, 0x2020_3852);
        assert_eq!(DRM_FORMAT_GR88, 0x3838_5247);
        assert_eq!(DRM_FORMAT_XRGB8888, 0x3432_5258);
    }

    #[test]
    fn format_map_covers_both_directions() {
        assert_eq!(drm_to_vk(DRM_FORMAT_R8), Some(vk::Format::R8_UNORM));
        assert_eq!(drm_to_vk(DRM_FORMAT_RG88), Some(vk::Format::R8G8_UNORM));
        assert_eq!(
            drm_to_vk(DRM_FORMAT_Y416),
            Some(vk::Format::R16G16B16A16_UNORM)
        );
        assert_eq!(drm_to_vk(fourcc(*b"NV12")), None);
        assert_eq!(vk_to_drm(vk::Format::R16_UNORM), Some(DRM_FORMAT_R16));
        assert_eq!(vk_to_drm(vk::Format::D32_SFLOAT), None);
    }

    #[test]
    fn ambiguous_formats_export_their_first_fourcc() {
        // GR88 over RG88, ARGB over XRGB, XV36 over Y416.
        assert_eq!(vk_to_drm(vk::Format::R8G8_UNORM), Some(DRM_FORMAT_GR88));
        assert_eq!(
            vk_to_drm(vk::Format::B8G8R8A8_UNORM),
            Some(DRM_FORMAT_ARGB8888)
        );
        assert_eq!(
            vk_to_drm(vk::Format::R16G16B16A16_UNORM),
            Some(DRM_FORMAT_XVYU12_16161616)
        );
    }

    fn layer(fourcc: u32, object_index: usize) -> DrmLayer {
        DrmLayer {
            fourcc,
            planes: vec![DrmPlane {
                object_index,
                offset: 0,
                pitch: 256,
            }],
        }
    }

    #[test]
    fn validation_resolves_layer_formats() {
        let layers = [layer(DRM_FORMAT_R8, 0), layer(DRM_FORMAT_GR88, 0)];
        let formats = validate_layers(&layers, 1, 2).unwrap();
        assert_eq!(&formats[..], &[vk::Format::R8_UNORM, vk::Format::R8G8_UNORM]);
    }

    #[test]
    fn validation_requires_one_layer_per_plane() {
        let layers = [layer(DRM_FORMAT_R8, 0), layer(DRM_FORMAT_GR88, 0)];
        assert!(validate_layers(&layers, 1, 3).is_err());
        assert!(validate_layers(&[], 1, 1).is_err());
    }

    #[test]
    fn validation_rejects_unknown_fourccs() {
        let layers = [layer(fourcc(*b"NV12"), 0)];
        assert!(validate_layers(&layers, 1, 1).is_err());
    }

    #[test]
    fn validation_checks_object_references() {
        let layers = [layer(DRM_FORMAT_R8, 2)];
        assert!(validate_layers(&layers, 2, 1).is_err());
        assert!(validate_layers(&layers, 3, 1).is_ok());
    }

    #[test]
    fn memory_plane_aspects_by_index() {
        assert_eq!(
            memory_plane_aspect(0),
            vk::ImageAspectFlags::MEMORY_PLANE_0_EXT
        );
        assert_eq!(
            memory_plane_aspect(1),
            vk::ImageAspectFlags::MEMORY_PLANE_1_EXT
        );
        assert_eq!(
            memory_plane_aspect(2),
            vk::ImageAspectFlags::MEMORY_PLANE_2_EXT
        );
    }
}
