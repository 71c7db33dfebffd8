//! Frames and the context that allocates them.
//!
//! A [`Frame`] is a short list of images (one combined multiplanar image, or
//! one image per plane) with a timeline semaphore and tracked layout, access
//! and queue-family ownership per image. A [`FramesContext`] fixes the
//! format, geometry and usage of the frames it hands out and owns the
//! execution pools that initialize and transfer them.
//!
//! Frames are shared handles. Any number of threads may hold clones; the
//! tracked state is guarded by a per-frame lock that submission code holds
//! from dependency registration to queue submission, which is longer than a
//! guard can live, hence the explicit [`Frame::lock`]/[`Frame::unlock`] pair.

use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use ash::vk;
use smallvec::SmallVec;

use crate::alloc::DeviceMemory;
use crate::device::{Device, HasDevice};
use crate::error::{Error, Result, VulkanError};
use crate::exec::{prepare_frame, ExecPool, PrepMode};
use crate::format::{self, FormatEntry, PixelFormat};
use crate::probe::{FormatPlan, ResolveFlags};
use crate::queue::QueueRole;
use crate::sync::Semaphore;
use crate::utils::{align_up, AsVkHandle, SharingMode};

/// The handle type used when frame memory is created exportable.
#[cfg(unix)]
pub const EXPORTABLE_MEMORY_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;
#[cfg(windows)]
pub const EXPORTABLE_MEMORY_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32;

/// Tracked state of one image of a frame.
///
/// Kept current by the execution engine so barriers can be built without
/// asking the device. `sem_value` is the timeline value of the last completed
/// or pending submission against the image; the next submission waits it and
/// signals `sem_value + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags2,
    pub queue_family: u32,
    pub sem_value: u64,
}

/// A binary lock that, unlike a `MutexGuard`, can be held across calls.
#[derive(Default)]
struct FrameLock {
    held: Mutex<bool>,
    cond: Condvar,
}

impl FrameLock {
    fn acquire(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cond.wait(held).unwrap();
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap();
        debug_assert!(*held);
        *held = false;
        drop(held);
        self.cond.notify_one();
    }
}

pub type FrameLockFn = Box<dyn Fn(&Frame) + Send + Sync>;

/// Overridable frame lock hooks.
///
/// The default locks the frame's internal lock. Callers that coordinate
/// frame access with an outside scheduler can substitute their own pair; the
/// engine calls `lock` when a frame becomes a submission dependency and
/// `unlock` once the submission is queued or discarded.
pub struct FrameLockHooks {
    pub lock: FrameLockFn,
    pub unlock: FrameLockFn,
}

impl FrameLockHooks {
    fn internal() -> Self {
        FrameLockHooks {
            lock: Box::new(|frame: &Frame| frame.0.lock.acquire()),
            unlock: Box::new(|frame: &Frame| frame.0.lock.release()),
        }
    }
}

/// Backing memory of a frame.
pub(crate) enum FrameMemory {
    /// One allocation per image.
    PerImage(SmallVec<[DeviceMemory; 4]>),
    /// One allocation for all images, bound at aligned offsets.
    Contiguous {
        memory: DeviceMemory,
        offsets: SmallVec<[vk::DeviceSize; 4]>,
        sizes: SmallVec<[vk::DeviceSize; 4]>,
    },
}

impl FrameMemory {
    pub(crate) fn handle(&self, image: usize) -> vk::DeviceMemory {
        match self {
            FrameMemory::PerImage(memories) => memories[image].vk_handle(),
            FrameMemory::Contiguous { memory, .. } => memory.vk_handle(),
        }
    }

    pub(crate) fn offset(&self, image: usize) -> vk::DeviceSize {
        match self {
            FrameMemory::PerImage(_) => 0,
            FrameMemory::Contiguous { offsets, .. } => offsets[image],
        }
    }

    pub(crate) fn size(&self, image: usize) -> vk::DeviceSize {
        match self {
            FrameMemory::PerImage(memories) => memories[image].size(),
            FrameMemory::Contiguous { sizes, .. } => sizes[image],
        }
    }

    pub(crate) fn is_contiguous(&self) -> bool {
        matches!(self, FrameMemory::Contiguous { .. })
    }

    /// Size of the whole allocation backing `image`, not the image's slice
    /// of it. Export handles cover allocations, not slices.
    pub(crate) fn object_size(&self, image: usize) -> vk::DeviceSize {
        match self {
            FrameMemory::PerImage(memories) => memories[image].size(),
            FrameMemory::Contiguous { memory, .. } => memory.size(),
        }
    }

    fn property_flags(&self) -> vk::MemoryPropertyFlags {
        match self {
            FrameMemory::PerImage(memories) => memories[0].property_flags(),
            FrameMemory::Contiguous { memory, .. } => memory.property_flags(),
        }
    }
}

struct FrameInner {
    device: Device,
    format: PixelFormat,
    plan: FormatPlan,
    width: u32,
    height: u32,
    layers: u32,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    create_flags: vk::ImageCreateFlags,
    images: SmallVec<[vk::Image; 4]>,
    memory: FrameMemory,
    semaphores: SmallVec<[Semaphore; 4]>,
    states: Mutex<SmallVec<[ImageState; 4]>>,
    lock: FrameLock,
    hooks: Arc<FrameLockHooks>,
    #[cfg(unix)]
    export: Mutex<Option<crate::interop::FrameExport>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        tracing::trace!(images = ?self.images, "drop frame");
        let states = self.states.get_mut().unwrap();
        let values: SmallVec<[u64; 4]> = states.iter().map(|s| s.sem_value).collect();
        let semaphores: SmallVec<[vk::Semaphore; 4]> =
            self.semaphores.iter().map(|s| s.vk_handle()).collect();
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        // Retire every submission still referencing the images. A device
        // loss fails the wait; the teardown proceeds regardless.
        // Safety: no host synchronization rules for vkWaitSemaphores.
        let _ = unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) };
        // Exported handles reference the memory and must close first.
        #[cfg(unix)]
        drop(self.export.get_mut().unwrap().take());
        for &image in &self.images {
            // Safety: the semaphore wait above retired all GPU work.
            unsafe { self.device.destroy_image(image, None) };
        }
        // Memory and semaphores drop with the struct, after the images.
    }
}

/// One allocated frame. Clones share the images; equality is identity.
#[derive(Clone)]
pub struct Frame(Arc<FrameInner>);

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Frame {}

impl Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("format", &self.0.format)
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("images", &self.0.images)
            .finish()
    }
}

impl Frame {
    pub fn pixel_format(&self) -> PixelFormat {
        self.0.format
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn layers(&self) -> u32 {
        self.0.layers
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.0.tiling
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.0.usage
    }

    pub fn create_flags(&self) -> vk::ImageCreateFlags {
        self.0.create_flags
    }

    /// Property flags of the backing memory type.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.0.memory.property_flags()
    }

    pub fn image_count(&self) -> usize {
        self.0.images.len()
    }

    pub fn image(&self, index: usize) -> vk::Image {
        self.0.images[index]
    }

    /// Snapshot of one image's tracked state.
    pub fn state(&self, index: usize) -> ImageState {
        self.0.states.lock().unwrap()[index]
    }

    /// Takes the frame lock via the installed hooks. Blocks while another
    /// holder (usually a pending submission) has it.
    pub fn lock(&self) {
        (self.0.hooks.lock)(self)
    }

    /// Releases the frame lock via the installed hooks.
    pub fn unlock(&self) {
        (self.0.hooks.unlock)(self)
    }

    pub(crate) fn plan(&self) -> &FormatPlan {
        &self.0.plan
    }

    pub(crate) fn states(&self) -> MutexGuard<'_, SmallVec<[ImageState; 4]>> {
        self.0.states.lock().unwrap()
    }

    pub(crate) fn semaphore(&self, index: usize) -> &Semaphore {
        &self.0.semaphores[index]
    }

    pub(crate) fn memory(&self) -> &FrameMemory {
        &self.0.memory
    }

    #[cfg(unix)]
    pub(crate) fn export_slot(&self) -> &Mutex<Option<crate::interop::FrameExport>> {
        &self.0.export
    }
}

impl HasDevice for Frame {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

/// Tunables for a [`FramesContext`]. Unset fields get device-derived
/// defaults at creation.
pub struct FramesOptions {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Defaults to LINEAR when the device was created with `linear_images`,
    /// else OPTIMAL.
    pub tiling: Option<vk::ImageTiling>,
    /// Defaults to the supported subset of transfer-src/dst, sampled and
    /// storage.
    pub usage: Option<vk::ImageUsageFlags>,
    /// Defaults to aliasing, plus mutable-format and extended-usage when a
    /// combined multiplanar representation is used.
    pub create_flags: Option<vk::ImageCreateFlags>,
    /// Explicit per-image formats. Must be the catalog's combined
    /// representation or its exact per-plane sequence.
    pub formats: Option<Vec<vk::Format>>,
    pub layers: u32,
    /// Back all images of a frame with a single allocation at aligned
    /// offsets.
    pub contiguous: bool,
    /// Reject the combined multiplanar representation for this context even
    /// when the device supports it.
    pub disable_multiplane: bool,
    /// Defaults to each frame's internal lock.
    pub lock_hooks: Option<Arc<FrameLockHooks>>,
}

impl FramesOptions {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        FramesOptions {
            format,
            width,
            height,
            tiling: None,
            usage: None,
            create_flags: None,
            formats: None,
            layers: 1,
            contiguous: false,
            disable_multiplane: false,
            lock_hooks: None,
        }
    }
}

pub(crate) struct FramesInner {
    device: Device,
    format: PixelFormat,
    plan: FormatPlan,
    width: u32,
    height: u32,
    layers: u32,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    create_flags: vk::ImageCreateFlags,
    contiguous: bool,
    families: Vec<u32>,
    hooks: Arc<FrameLockHooks>,
    semaphore_exportable: bool,
    /// Handle types the images are created exportable as, and the type the
    /// allocations export. Both empty without the external-memory extension.
    image_export_types: vk::ExternalMemoryHandleTypeFlags,
    alloc_export_types: vk::ExternalMemoryHandleTypeFlags,
    compute_pool: ExecPool,
    upload_pool: ExecPool,
    download_pool: ExecPool,
}

/// Allocates frames of one format and geometry.
///
/// Shared handle; clones refer to the same pools and configuration.
#[derive(Clone)]
pub struct FramesContext(Arc<FramesInner>);

impl PartialEq for FramesContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for FramesContext {}

impl Debug for FramesContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramesContext")
            .field("format", &self.0.format)
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("tiling", &self.0.tiling)
            .finish()
    }
}

impl FramesContext {
    /// Resolves the format, fills defaults, creates the execution pools and
    /// test-creates a frame so misconfiguration fails here rather than at
    /// the first allocation.
    pub fn new(device: &Device, options: FramesOptions) -> Result<FramesContext> {
        let physical = device.physical_device();
        let layers = options.layers.max(1);
        let tiling = options.tiling.unwrap_or(if device.linear_images() {
            vk::ImageTiling::LINEAR
        } else {
            vk::ImageTiling::OPTIMAL
        });
        let resolve_flags = ResolveFlags {
            disable_multiplane: device.disable_multiplane() || options.disable_multiplane,
            need_storage: options
                .usage
                .is_some_and(|u| u.contains(vk::ImageUsageFlags::STORAGE)),
        };

        let entry = format::lookup(options.format).ok_or_else(|| {
            Error::Unsupported(format!("unknown pixel format {:?}", options.format))
        })?;
        let plan = match &options.formats {
            None => physical.resolve_format(options.format, tiling, resolve_flags)?,
            Some(formats) => {
                if format_list_is_combined(entry, formats)? {
                    let plan = physical.resolve_format(options.format, tiling, resolve_flags)?;
                    if plan.image_count() != 1 || plan.images[0] != entry.ideal {
                        return Err(Error::Unsupported(format!(
                            "device cannot use the combined representation of {:?}",
                            options.format
                        )));
                    }
                    plan
                } else {
                    physical.resolve_format(
                        options.format,
                        tiling,
                        ResolveFlags {
                            disable_multiplane: true,
                            ..resolve_flags
                        },
                    )?
                }
            }
        };

        let usage = options
            .usage
            .unwrap_or_else(|| default_usage(plan.supported_usage));
        let multiplanar = plan.image_count() == 1 && options.format.plane_count() > 1;
        let create_flags = options
            .create_flags
            .unwrap_or_else(|| default_create_flags(usage, multiplanar));
        let hooks = options
            .lock_hooks
            .unwrap_or_else(|| Arc::new(FrameLockHooks::internal()));

        let plan_roles = device.queue_plan();
        let compute_queues = plan_roles
            .role(QueueRole::Compute)
            .ok_or(Error::NoQueues)?
            .queue_count as usize;
        let transfer_queues = plan_roles
            .role(QueueRole::Transfer)
            .ok_or(Error::NoQueues)?
            .queue_count as usize;
        let compute_pool = ExecPool::new(device, QueueRole::Compute, compute_queues)?;
        let upload_pool = ExecPool::new(device, QueueRole::Transfer, transfer_queues * 2)?;
        let download_pool = ExecPool::new(device, QueueRole::Transfer, transfer_queues)?;

        #[cfg(unix)]
        let memory_exportable = device.extension_enabled(ash::khr::external_memory_fd::NAME);
        #[cfg(windows)]
        let memory_exportable = device.extension_enabled(ash::khr::external_memory_win32::NAME);
        let (image_export_types, alloc_export_types) = if memory_exportable {
            probe_export_types(device, &plan, tiling, usage)
        } else {
            (
                vk::ExternalMemoryHandleTypeFlags::empty(),
                vk::ExternalMemoryHandleTypeFlags::empty(),
            )
        };

        #[cfg(unix)]
        let semaphore_exportable =
            device.extension_enabled(ash::khr::external_semaphore_fd::NAME);
        #[cfg(windows)]
        let semaphore_exportable =
            device.extension_enabled(ash::khr::external_semaphore_win32::NAME);

        let inner = FramesInner {
            device: device.clone(),
            format: options.format,
            plan,
            width: options.width,
            height: options.height,
            layers,
            tiling,
            usage,
            create_flags,
            contiguous: options.contiguous,
            families: plan_roles.image_sharing_families(),
            hooks,
            semaphore_exportable,
            image_export_types,
            alloc_export_types,
            compute_pool,
            upload_pool,
            download_pool,
        };

        // Creation can fail for reasons the probe cannot see (layer counts,
        // dimension limits), so fail now rather than at the first alloc.
        let (images, semaphores) =
            inner.create_images(vk::ExternalMemoryHandleTypeFlags::empty())?;
        destroy_images(&inner.device, &images);
        drop(semaphores);

        tracing::info!(
            format = ?inner.format,
            width = inner.width,
            height = inner.height,
            tiling = ?inner.tiling,
            usage = ?inner.usage,
            images = inner.plan.image_count(),
            "created frames context"
        );
        Ok(FramesContext(Arc::new(inner)))
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.0.format
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.0.tiling
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.0.usage
    }

    pub fn create_flags(&self) -> vk::ImageCreateFlags {
        self.0.create_flags
    }

    pub fn layers(&self) -> u32 {
        self.0.layers
    }

    pub(crate) fn plan(&self) -> &FormatPlan {
        &self.0.plan
    }

    pub(crate) fn compute_pool(&self) -> &ExecPool {
        &self.0.compute_pool
    }

    #[cfg(unix)]
    pub(crate) fn sharing_families(&self) -> &[u32] {
        &self.0.families
    }

    #[cfg(unix)]
    pub(crate) fn alloc_export_types(&self) -> vk::ExternalMemoryHandleTypeFlags {
        self.0.alloc_export_types
    }

    #[cfg(unix)]
    pub(crate) fn semaphore_exportable(&self) -> bool {
        self.0.semaphore_exportable
    }

    pub(crate) fn upload_pool(&self) -> &ExecPool {
        &self.0.upload_pool
    }

    pub(crate) fn download_pool(&self) -> &ExecPool {
        &self.0.download_pool
    }

    /// Allocates a frame and transitions it out of the undefined layout.
    ///
    /// Decode-capable usage picks the matching initial transition: a frame
    /// usable only as a reference picture becomes a decode-DPB target, a
    /// decode output becomes a decode-DST target, anything else a transfer
    /// write target.
    pub fn alloc(&self) -> Result<Frame> {
        let inner = &self.0;
        let (images, semaphores) = inner.create_images(inner.image_export_types)?;
        let memory = if inner.contiguous {
            alloc_bind_contiguous(&inner.device, &images, inner.tiling, inner.alloc_export_types)
        } else {
            alloc_bind_per_image(&inner.device, &images, inner.tiling, inner.alloc_export_types)
        };
        let memory = match memory {
            Ok(memory) => memory,
            Err(err) => {
                destroy_images(&inner.device, &images);
                return Err(err);
            }
        };

        let tracked_family = if inner.families.len() > 1 {
            vk::QUEUE_FAMILY_IGNORED
        } else {
            inner.families[0]
        };
        let states: SmallVec<[ImageState; 4]> = images
            .iter()
            .map(|_| ImageState {
                layout: vk::ImageLayout::UNDEFINED,
                access: vk::AccessFlags2::empty(),
                queue_family: tracked_family,
                sem_value: 0,
            })
            .collect();

        let frame = Frame(Arc::new(FrameInner {
            device: inner.device.clone(),
            format: inner.format,
            plan: inner.plan.clone(),
            width: inner.width,
            height: inner.height,
            layers: inner.layers,
            tiling: inner.tiling,
            usage: inner.usage,
            create_flags: inner.create_flags,
            images,
            memory,
            semaphores,
            states: Mutex::new(states),
            lock: FrameLock::default(),
            hooks: inner.hooks.clone(),
            #[cfg(unix)]
            export: Mutex::new(None),
        }));

        let mode = if inner.usage.contains(vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR)
            && !inner.usage.contains(vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR)
        {
            PrepMode::DecodeDpb
        } else if inner.usage.contains(vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR) {
            PrepMode::DecodeDst
        } else {
            PrepMode::Write
        };
        prepare_frame(&inner.compute_pool, &frame, mode)?;
        tracing::trace!(frame = ?frame, "allocated frame");
        Ok(frame)
    }

    /// Blocks until every submission issued through this context's pools has
    /// completed.
    pub fn wait_idle(&self) -> Result<()> {
        self.0.compute_pool.wait_idle()?;
        self.0.upload_pool.wait_idle()?;
        self.0.download_pool.wait_idle()
    }

    /// Wraps externally imported images and their memory in a [`Frame`] of
    /// this context's format and geometry. Every image starts in the
    /// undefined layout with a zeroed timeline; the caller transitions it.
    #[cfg(unix)]
    pub(crate) fn adopt_imported(
        &self,
        images: SmallVec<[vk::Image; 4]>,
        memory: SmallVec<[DeviceMemory; 4]>,
        semaphores: SmallVec<[Semaphore; 4]>,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
    ) -> Frame {
        let inner = &self.0;
        let tracked_family = if inner.families.len() > 1 {
            vk::QUEUE_FAMILY_IGNORED
        } else {
            inner.families[0]
        };
        let states: SmallVec<[ImageState; 4]> = images
            .iter()
            .map(|_| ImageState {
                layout: vk::ImageLayout::UNDEFINED,
                access: vk::AccessFlags2::empty(),
                queue_family: tracked_family,
                sem_value: 0,
            })
            .collect();
        Frame(Arc::new(FrameInner {
            device: inner.device.clone(),
            format: inner.format,
            plan: inner.plan.clone(),
            width: inner.width,
            height: inner.height,
            layers: 1,
            tiling,
            usage,
            create_flags: vk::ImageCreateFlags::empty(),
            images,
            memory: FrameMemory::PerImage(memory),
            semaphores,
            states: Mutex::new(states),
            lock: FrameLock::default(),
            hooks: inner.hooks.clone(),
            export: Mutex::new(None),
        }))
    }
}

impl HasDevice for FramesContext {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl FramesInner {
    /// Creates the images and semaphores of one frame, unwinding on failure.
    fn create_images(
        &self,
        export_types: vk::ExternalMemoryHandleTypeFlags,
    ) -> Result<(SmallVec<[vk::Image; 4]>, SmallVec<[Semaphore; 4]>)> {
        let sharing: SharingMode<&[u32]> = if self.families.len() > 1 {
            SharingMode::Concurrent {
                queue_family_indices: &self.families,
            }
        } else {
            SharingMode::Exclusive
        };

        let mut images: SmallVec<[vk::Image; 4]> = SmallVec::new();
        let mut semaphores: SmallVec<[Semaphore; 4]> = SmallVec::new();
        for (i, &image_format) in self.plan.images.iter().enumerate() {
            let extent = self.format.plane_extent(self.width, self.height, i);
            let mut external_info =
                vk::ExternalMemoryImageCreateInfo::default().handle_types(export_types);
            let mut info = vk::ImageCreateInfo {
                image_type: vk::ImageType::TYPE_2D,
                format: image_format,
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: self.layers,
                flags: self.create_flags,
                tiling: self.tiling,
                initial_layout: vk::ImageLayout::UNDEFINED,
                usage: self.usage,
                samples: vk::SampleCountFlags::TYPE_1,
                sharing_mode: sharing.as_raw(),
                ..Default::default()
            }
            .queue_family_indices(sharing.queue_family_indices());
            if !export_types.is_empty() {
                info = info.push_next(&mut external_info);
            }
            // Safety: no host synchronization rules for vkCreateImage.
            let image = match unsafe { self.device.create_image(&info, None) } {
                Ok(image) => image,
                Err(ret) => {
                    tracing::error!(result = ?ret, format = ?image_format, "failed to create image");
                    destroy_images(&self.device, &images);
                    return Err(VulkanError(ret).into());
                }
            };
            images.push(image);

            let semaphore = if self.semaphore_exportable {
                Semaphore::new_exportable(self.device.clone(), 0)
            } else {
                Semaphore::new(self.device.clone(), 0)
            };
            match semaphore {
                Ok(semaphore) => semaphores.push(semaphore),
                Err(err) => {
                    destroy_images(&self.device, &images);
                    return Err(err);
                }
            }
        }
        Ok((images, semaphores))
    }
}

pub(crate) fn destroy_images(device: &Device, images: &[vk::Image]) {
    for &image in images {
        // Safety: callers only unwind images no submission has seen.
        unsafe { device.destroy_image(image, None) };
    }
}

/// Memory requirements of an image, and whether the driver asks for a
/// dedicated allocation.
pub(crate) fn image_memory_requirements(
    device: &Device,
    image: vk::Image,
) -> (vk::MemoryRequirements, bool) {
    let mut dedicated_req = vk::MemoryDedicatedRequirements::default();
    let mut reqs2 = vk::MemoryRequirements2::default().push_next(&mut dedicated_req);
    let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
    // Safety: no host synchronization rules.
    unsafe { device.get_image_memory_requirements2(&info, &mut reqs2) };
    let reqs = reqs2.memory_requirements;
    let dedicated = dedicated_req.prefers_dedicated_allocation != vk::FALSE
        || dedicated_req.requires_dedicated_allocation != vk::FALSE;
    (reqs, dedicated)
}

fn image_memory_flags(tiling: vk::ImageTiling) -> vk::MemoryPropertyFlags {
    // Linear frames exist to be mapped; optimal frames stay on the device.
    if tiling == vk::ImageTiling::LINEAR {
        vk::MemoryPropertyFlags::HOST_VISIBLE
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    }
}

fn alloc_bind_per_image(
    device: &Device,
    images: &[vk::Image],
    tiling: vk::ImageTiling,
    export_types: vk::ExternalMemoryHandleTypeFlags,
) -> Result<FrameMemory> {
    let flags = image_memory_flags(tiling);
    let mut memories: SmallVec<[DeviceMemory; 4]> = SmallVec::new();
    for &image in images {
        let (reqs, dedicated) = image_memory_requirements(device, image);
        let mut export_info =
            vk::ExportMemoryAllocateInfo::default().handle_types(export_types);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
        if !export_types.is_empty() {
            dedicated_info.p_next = <*const _>::cast(&export_info);
        }
        let memory = if dedicated {
            DeviceMemory::alloc(device, &reqs, flags, Some(&mut dedicated_info))?
        } else if !export_types.is_empty() {
            DeviceMemory::alloc(device, &reqs, flags, Some(&mut export_info))?
        } else {
            DeviceMemory::alloc(device, &reqs, flags, None)?
        };
        memories.push(memory);
    }

    let binds: SmallVec<[vk::BindImageMemoryInfo; 4]> = images
        .iter()
        .zip(&memories)
        .map(|(&image, memory)| {
            vk::BindImageMemoryInfo::default()
                .image(image)
                .memory(memory.vk_handle())
        })
        .collect();
    // Safety: the images are fresh and unbound.
    unsafe { device.bind_image_memory2(&binds) }.map_err(|ret| {
        tracing::error!(result = ?ret, "failed to bind image memory");
        VulkanError(ret)
    })?;
    Ok(FrameMemory::PerImage(memories))
}

fn alloc_bind_contiguous(
    device: &Device,
    images: &[vk::Image],
    tiling: vk::ImageTiling,
    export_types: vk::ExternalMemoryHandleTypeFlags,
) -> Result<FrameMemory> {
    let mut reqs: SmallVec<[vk::MemoryRequirements; 4]> = SmallVec::new();
    for &image in images {
        // A shared allocation cannot honor per-image dedicated hints.
        let (r, _) = image_memory_requirements(device, image);
        reqs.push(r);
    }
    let (total, offsets, type_bits) = contiguous_layout(&reqs)?;
    let merged = vk::MemoryRequirements {
        size: total,
        alignment: reqs[0].alignment,
        memory_type_bits: type_bits,
    };
    let flags = image_memory_flags(tiling);
    let mut export_info = vk::ExportMemoryAllocateInfo::default().handle_types(export_types);
    let memory = if !export_types.is_empty() {
        DeviceMemory::alloc(device, &merged, flags, Some(&mut export_info))?
    } else {
        DeviceMemory::alloc(device, &merged, flags, None)?
    };

    let binds: SmallVec<[vk::BindImageMemoryInfo; 4]> = images
        .iter()
        .zip(&offsets)
        .map(|(&image, &offset)| {
            vk::BindImageMemoryInfo::default()
                .image(image)
                .memory(memory.vk_handle())
                .memory_offset(offset)
        })
        .collect();
    // Safety: the images are fresh and unbound.
    unsafe { device.bind_image_memory2(&binds) }.map_err(|ret| {
        tracing::error!(result = ?ret, "failed to bind image memory");
        VulkanError(ret)
    })?;

    let sizes = reqs.iter().map(|r| r.size).collect();
    Ok(FrameMemory::Contiguous {
        memory,
        offsets,
        sizes,
    })
}

/// Packs image requirements into one allocation: aligned offsets, total
/// size, and the intersection of the type masks.
fn contiguous_layout(
    reqs: &[vk::MemoryRequirements],
) -> Result<(vk::DeviceSize, SmallVec<[vk::DeviceSize; 4]>, u32)> {
    let mut offsets: SmallVec<[vk::DeviceSize; 4]> = SmallVec::new();
    let mut cursor = 0;
    let mut type_bits = !0u32;
    for r in reqs {
        cursor = align_up(cursor, r.alignment);
        offsets.push(cursor);
        cursor += r.size;
        type_bits &= r.memory_type_bits;
    }
    if type_bits == 0 {
        return Err(Error::Unsupported(
            "image memory types do not overlap, cannot allocate contiguously".into(),
        ));
    }
    Ok((cursor, offsets, type_bits))
}

fn default_usage(supported: vk::ImageUsageFlags) -> vk::ImageUsageFlags {
    supported
        & (vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::SAMPLED)
}

/// Frames that will be sampled get the alias flag so planes can be addressed
/// as separate images; DPB-only frames never alias. A combined multiplanar
/// image additionally needs mutable-format and extended-usage for per-plane
/// views.
fn default_create_flags(usage: vk::ImageUsageFlags, multiplanar: bool) -> vk::ImageCreateFlags {
    let lone_dpb = usage.contains(vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR)
        && !usage.contains(vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR);
    let sampleable =
        usage.intersects(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE);
    let mut flags = vk::ImageCreateFlags::empty();
    if sampleable && !lone_dpb {
        flags |= vk::ImageCreateFlags::ALIAS;
        if multiplanar {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT | vk::ImageCreateFlags::EXTENDED_USAGE;
        }
    }
    flags
}

/// Whether an explicit format list picks the combined representation.
/// Returns `Unsupported` when the list matches neither the combined format
/// nor the exact per-plane sequence of the catalog row.
fn format_list_is_combined(entry: &'static FormatEntry, formats: &[vk::Format]) -> Result<bool> {
    if entry.image_count == 1 && formats.len() == 1 && formats[0] == entry.ideal {
        return Ok(true);
    }
    if formats == &entry.fallback[..entry.fallback_count as usize] {
        return Ok(false);
    }
    Err(Error::Unsupported(format!(
        "format list {:?} is incompatible with {:?}",
        formats, entry.format
    )))
}

/// Probes which handle types frame images of this configuration can be
/// exported as. Candidates are the opaque platform type and, when its
/// extension is enabled, dma-buf. Returns the accumulated compatible types
/// to create images with and the types allocations will export; both empty
/// when no candidate passes.
fn probe_export_types(
    device: &Device,
    plan: &FormatPlan,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
) -> (
    vk::ExternalMemoryHandleTypeFlags,
    vk::ExternalMemoryHandleTypeFlags,
) {
    let mut candidates: SmallVec<[vk::ExternalMemoryHandleTypeFlags; 2]> = SmallVec::new();
    candidates.push(EXPORTABLE_MEMORY_HANDLE_TYPE);
    #[cfg(unix)]
    if device.extension_enabled(ash::ext::external_memory_dma_buf::NAME) {
        candidates.push(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    }

    let mut image_types = vk::ExternalMemoryHandleTypeFlags::empty();
    let mut alloc_types = vk::ExternalMemoryHandleTypeFlags::empty();
    for candidate in candidates {
        let mut external_props = vk::ExternalImageFormatProperties::default();
        let mut props = vk::ImageFormatProperties2::default().push_next(&mut external_props);
        let mut external_info =
            vk::PhysicalDeviceExternalImageFormatInfo::default().handle_type(candidate);
        let info = vk::PhysicalDeviceImageFormatInfo2::default()
            .format(plan.images[0])
            .ty(vk::ImageType::TYPE_2D)
            .tiling(tiling)
            .usage(usage)
            .flags(vk::ImageCreateFlags::ALIAS)
            .push_next(&mut external_info);
        match device.physical_device().image_format_properties(&info, &mut props) {
            Ok(true) => {
                alloc_types |= candidate;
                image_types |= external_props
                    .external_memory_properties
                    .compatible_handle_types;
            }
            Ok(false) => {
                tracing::debug!(format = ?plan.images[0], handle_type = ?candidate, "handle type not exportable");
            }
            Err(err) => {
                tracing::warn!(error = %err, handle_type = ?candidate, "export probe failed");
            }
        }
    }
    if alloc_types.is_empty() {
        tracing::debug!(format = ?plan.images[0], "no exportable handle type, frames stay internal");
    }
    (image_types, alloc_types)
}

/// Allocation limits for frames on a device.
#[derive(Clone, Debug)]
pub struct FrameConstraints {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Logical formats with a usable representation under the device's
    /// default tiling.
    pub formats: Vec<PixelFormat>,
}

impl FrameConstraints {
    pub fn query(device: &Device) -> FrameConstraints {
        let tiling = if device.linear_images() {
            vk::ImageTiling::LINEAR
        } else {
            vk::ImageTiling::OPTIMAL
        };
        let limits = &device.physical_device().properties().limits;
        FrameConstraints {
            min_width: 1,
            min_height: 1,
            max_width: limits.max_image_dimension2_d,
            max_height: limits.max_image_dimension2_d,
            formats: device.physical_device().supported_formats(tiling),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn frame_lock_excludes_concurrent_holders() {
        let lock = Arc::new(FrameLock::default());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    lock.acquire();
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(seen, 0, "two threads inside the lock");
                    std::thread::yield_now();
                    counter.fetch_sub(1, Ordering::SeqCst);
                    lock.release();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn frame_lock_release_wakes_waiter() {
        let lock = Arc::new(FrameLock::default());
        lock.acquire();
        let waiter = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.acquire();
                lock.release();
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        lock.release();
        waiter.join().unwrap();
    }

    #[test]
    fn default_usage_is_capped_by_support() {
        let supported = vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::COLOR_ATTACHMENT;
        let usage = default_usage(supported);
        assert!(usage.contains(vk::ImageUsageFlags::SAMPLED));
        // Unsupported storage is dropped, attachment use is never defaulted.
        assert!(!usage.contains(vk::ImageUsageFlags::STORAGE));
        assert!(!usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }

    #[test]
    fn sampleable_frames_default_to_aliasing() {
        let flags = default_create_flags(
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            false,
        );
        assert_eq!(flags, vk::ImageCreateFlags::ALIAS);
    }

    #[test]
    fn multiplanar_sampleable_frames_add_view_flags() {
        let flags = default_create_flags(vk::ImageUsageFlags::SAMPLED, true);
        assert!(flags.contains(vk::ImageCreateFlags::ALIAS));
        assert!(flags.contains(vk::ImageCreateFlags::MUTABLE_FORMAT));
        assert!(flags.contains(vk::ImageCreateFlags::EXTENDED_USAGE));
    }

    #[test]
    fn lone_dpb_frames_get_no_flags() {
        let flags = default_create_flags(
            vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR | vk::ImageUsageFlags::SAMPLED,
            true,
        );
        assert_eq!(flags, vk::ImageCreateFlags::empty());
        // A DPB that is also a decode output is not "lone" and aliases.
        let flags = default_create_flags(
            vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR
                | vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR
                | vk::ImageUsageFlags::SAMPLED,
            false,
        );
        assert_eq!(flags, vk::ImageCreateFlags::ALIAS);
    }

    #[test]
    fn contiguous_layout_respects_alignment() {
        let reqs = [
            vk::MemoryRequirements {
                size: 100,
                alignment: 64,
                memory_type_bits: 0b0111,
            },
            vk::MemoryRequirements {
                size: 50,
                alignment: 256,
                memory_type_bits: 0b0110,
            },
            vk::MemoryRequirements {
                size: 10,
                alignment: 64,
                memory_type_bits: 0b0010,
            },
        ];
        let (total, offsets, type_bits) = contiguous_layout(&reqs).unwrap();
        assert_eq!(offsets.as_slice(), &[0, 256, 320]);
        assert_eq!(total, 330);
        assert_eq!(type_bits, 0b0010);
    }

    #[test]
    fn contiguous_layout_needs_a_common_memory_type() {
        let reqs = [
            vk::MemoryRequirements {
                size: 64,
                alignment: 64,
                memory_type_bits: 0b01,
            },
            vk::MemoryRequirements {
                size: 64,
                alignment: 64,
                memory_type_bits: 0b10,
            },
        ];
        assert!(matches!(
            contiguous_layout(&reqs),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn format_list_combined_or_planar() {
        let nv12 = format::lookup(PixelFormat::Nv12).unwrap();
        assert!(format_list_is_combined(nv12, &[nv12.ideal]).unwrap());
        assert!(!format_list_is_combined(
            nv12,
            &nv12.fallback[..nv12.fallback_count as usize]
        )
        .unwrap());
        assert!(format_list_is_combined(nv12, &[vk::Format::R8G8B8A8_UNORM]).is_err());
    }

    #[test]
    fn format_list_single_image_formats_are_combined() {
        let gray = format::lookup(PixelFormat::Gray8).unwrap();
        assert!(format_list_is_combined(gray, &[gray.ideal]).unwrap());
    }

    #[test]
    fn format_list_rejects_truncated_sequences() {
        let yuv = format::lookup(PixelFormat::Yuv420p).unwrap();
        assert!(format_list_is_combined(yuv, &[yuv.ideal]).unwrap());
        assert!(!format_list_is_combined(
            yuv,
            &yuv.fallback[..yuv.fallback_count as usize]
        )
        .unwrap());
        // A prefix of the per-plane sequence is not a valid list.
        assert!(format_list_is_combined(yuv, &yuv.fallback[..1]).is_err());
    }
}
