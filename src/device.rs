//! Logical device creation and management.
//!
//! [`DeviceBuilder`] performs one chained feature query against the physical
//! device, copies the curated subset of capabilities this crate drives,
//! negotiates optional device extensions and creates the logical device with
//! queues planned by [`QueuePlan`](crate::queue::QueuePlan). The resulting
//! [`Device`] is reference-counted; every GPU object in this crate holds one.
//!
//! Submissions to a queue must be serialized across the process. The device
//! owns a per-family, per-index mutex table sized at creation time, and
//! [`Device::lock_queue`] hands out guards over it. Hosts that already
//! serialize queue access (another runtime owning the same `VkDevice`) can
//! replace the table with [`DeviceBuilder::queue_lock_hooks`].

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::fmt::Debug;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;

use crate::error::{Error, Result, VulkanError};
use crate::instance::{ContextOptions, Instance};
use crate::physical_device::PhysicalDevice;
use crate::queue::{Queue, QueuePlan, QueueRole};
use crate::utils::AsVkHandle;

/// Device extensions enabled whenever the driver advertises them.
///
/// Everything here is optional; features gated on an entry check
/// [`Device::extension_enabled`] at use sites instead of assuming presence.
pub const OPTIONAL_DEVICE_EXTENSIONS: &[&CStr] = &[
    // Misc or required by other extensions
    ash::khr::portability_subset::NAME,
    ash::khr::push_descriptor::NAME,
    ash::khr::sampler_ycbcr_conversion::NAME,
    ash::ext::descriptor_buffer::NAME,
    ash::ext::physical_device_drm::NAME,
    ash::ext::shader_atomic_float::NAME,
    ash::khr::cooperative_matrix::NAME,
    // Imports/exports
    ash::khr::external_memory_fd::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::ext::image_drm_format_modifier::NAME,
    ash::khr::external_semaphore_fd::NAME,
    ash::ext::external_memory_host::NAME,
    #[cfg(windows)]
    ash::khr::external_memory_win32::NAME,
    #[cfg(windows)]
    ash::khr::external_semaphore_win32::NAME,
    // Video decoding
    ash::khr::video_queue::NAME,
    ash::khr::video_decode_queue::NAME,
    ash::khr::video_decode_h264::NAME,
    ash::khr::video_decode_h265::NAME,
    ash::khr::video_decode_av1::NAME,
];

/// The feature blocks requested at device creation.
///
/// The copy list in [`DeviceFeatures::curated`] is intentionally narrow:
/// only capabilities with a consumer somewhere in this crate or its users are
/// carried over, rather than blanket-enabling whatever the driver reports.
#[derive(Default)]
pub struct DeviceFeatures {
    pub core: vk::PhysicalDeviceFeatures,
    pub v11: vk::PhysicalDeviceVulkan11Features<'static>,
    pub v12: vk::PhysicalDeviceVulkan12Features<'static>,
    pub v13: vk::PhysicalDeviceVulkan13Features<'static>,
    pub descriptor_buffer: vk::PhysicalDeviceDescriptorBufferFeaturesEXT<'static>,
    pub atomic_float: vk::PhysicalDeviceShaderAtomicFloatFeaturesEXT<'static>,
    pub coop_matrix: vk::PhysicalDeviceCooperativeMatrixFeaturesKHR<'static>,
}

impl DeviceFeatures {
    /// Queries supported features through one chained call.
    ///
    /// Returns the supported set and whether timeline semaphores are
    /// available. `VkPhysicalDeviceVulkan12Features` has a timelineSemaphore
    /// field, but portability implementations may leave the versioned blocks
    /// unfilled, so the standalone struct answers the timeline question.
    fn query(physical_device: &PhysicalDevice) -> (DeviceFeatures, bool) {
        let mut supported = DeviceFeatures::default();
        let mut timeline = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut supported.v11)
            .push_next(&mut supported.v12)
            .push_next(&mut supported.v13)
            .push_next(&mut supported.descriptor_buffer)
            .push_next(&mut supported.atomic_float)
            .push_next(&mut supported.coop_matrix)
            .push_next(&mut timeline);
        // Safety: no host synchronization rules; the chain points at locals.
        unsafe {
            physical_device
                .instance()
                .get_physical_device_features2(physical_device.vk_handle(), &mut features2);
        }
        supported.core = features2.features;
        supported.unlink();
        (supported, timeline.timeline_semaphore == vk::TRUE)
    }

    /// Copies the supported flags this crate has a use for.
    ///
    /// Timeline semaphores are forced on; the builder verifies support before
    /// creation.
    fn curated(supported: &DeviceFeatures) -> DeviceFeatures {
        let mut enabled = DeviceFeatures::default();

        macro_rules! copy {
            ($block:ident: $($field:ident),+ $(,)?) => {
                $(enabled.$block.$field = supported.$block.$field;)+
            };
        }
        copy!(core:
            shader_image_gather_extended,
            shader_storage_image_read_without_format,
            shader_storage_image_write_without_format,
            fragment_stores_and_atomics,
            vertex_pipeline_stores_and_atomics,
            shader_int64,
            shader_int16,
            shader_float64,
        );
        copy!(v11: sampler_ycbcr_conversion, storage_push_constant16);
        copy!(v12:
            buffer_device_address,
            host_query_reset,
            storage_push_constant8,
            shader_int8,
            storage_buffer8_bit_access,
            uniform_and_storage_buffer8_bit_access,
            shader_float16,
            shader_shared_int64_atomics,
            vulkan_memory_model,
            vulkan_memory_model_device_scope,
        );
        copy!(v13:
            dynamic_rendering,
            maintenance4,
            synchronization2,
            compute_full_subgroups,
            shader_zero_initialize_workgroup_memory,
        );
        copy!(descriptor_buffer: descriptor_buffer, descriptor_buffer_push_descriptors);
        copy!(atomic_float: shader_buffer_float32_atomics, shader_buffer_float32_atomic_add);
        copy!(coop_matrix: cooperative_matrix);

        enabled.v12.timeline_semaphore = vk::TRUE;
        enabled
    }

    /// Heads a device-creation chain off the stored blocks.
    fn chain(&mut self) -> vk::PhysicalDeviceFeatures2<'_> {
        vk::PhysicalDeviceFeatures2::default()
            .features(self.core)
            .push_next(&mut self.v11)
            .push_next(&mut self.v12)
            .push_next(&mut self.v13)
            .push_next(&mut self.descriptor_buffer)
            .push_next(&mut self.atomic_float)
            .push_next(&mut self.coop_matrix)
    }

    /// Clears chain pointers so the blocks can be stored or moved.
    fn unlink(&mut self) {
        self.v11.p_next = std::ptr::null_mut();
        self.v12.p_next = std::ptr::null_mut();
        self.v13.p_next = std::ptr::null_mut();
        self.descriptor_buffer.p_next = std::ptr::null_mut();
        self.atomic_float.p_next = std::ptr::null_mut();
        self.coop_matrix.p_next = std::ptr::null_mut();
    }
}

/// Types created from a logical device.
pub trait HasDevice {
    fn device(&self) -> &Device;

    fn physical_device(&self) -> &PhysicalDevice {
        self.device().physical_device()
    }

    fn instance(&self) -> &Instance {
        self.device().physical_device().instance()
    }
}

/// A Vulkan logical device wrapper.
///
/// Reference-counted for cheap shared access. Holds the queue plan, the
/// enabled extension set and the per-queue mutex table; destroyed when the
/// last reference drops.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&self.0.device.handle())
            .finish()
    }
}

/// Function tables of the interop extensions, loaded once at device creation
/// for the extensions that were actually enabled.
struct ExternalFns {
    #[cfg(unix)]
    memory_fd: Option<ash::khr::external_memory_fd::Device>,
    #[cfg(unix)]
    semaphore_fd: Option<ash::khr::external_semaphore_fd::Device>,
    #[cfg(unix)]
    drm_modifier: Option<ash::ext::image_drm_format_modifier::Device>,
    host_import: Option<ash::ext::external_memory_host::Device>,
}

struct DeviceInner {
    physical_device: PhysicalDevice,
    device: ash::Device,
    enabled_extensions: BTreeSet<CString>,
    features: DeviceFeatures,
    plan: QueuePlan,
    locks: QueueLocks,
    external: ExternalFns,
    is_nvidia: bool,
    linear_images: bool,
    disable_multiplane: bool,
}
// Stored feature blocks never carry live chain pointers.
unsafe impl Send for DeviceInner {}
unsafe impl Sync for DeviceInner {}

impl Device {
    /// Creates a device builder for the given physical device.
    pub fn builder(physical_device: PhysicalDevice) -> DeviceBuilder {
        DeviceBuilder::new(physical_device)
    }

    /// Builds a device directly from parsed options.
    pub fn create(physical_device: PhysicalDevice, options: &ContextOptions) -> Result<Device> {
        let mut builder = DeviceBuilder::new(physical_device);
        builder.apply_options(options);
        builder.build()
    }

    pub fn instance(&self) -> &Instance {
        self.0.physical_device.instance()
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.0.physical_device
    }

    /// Whether a device extension was actually enabled at creation, as
    /// opposed to merely requested.
    pub fn extension_enabled(&self, name: &CStr) -> bool {
        self.0.enabled_extensions.contains(name)
    }

    /// The feature blocks the device was created with.
    pub fn features(&self) -> &DeviceFeatures {
        &self.0.features
    }

    pub fn queue_plan(&self) -> &QueuePlan {
        &self.0.plan
    }

    /// One vendor fronts cross-API imports with a device copy, which changes
    /// the profitable transfer strategy.
    pub fn is_nvidia(&self) -> bool {
        self.0.is_nvidia
    }

    /// Whether frames default to linear tiling.
    pub fn linear_images(&self) -> bool {
        self.0.linear_images
    }

    /// Whether format resolution skips combined multiplanar representations.
    pub fn disable_multiplane(&self) -> bool {
        self.0.disable_multiplane
    }

    /// Fetches a queue for `role`. The index wraps around the family's
    /// planned queue count so callers can round-robin freely.
    pub fn queue(&self, role: QueueRole, index: u32) -> Option<Queue> {
        let assignment = self.0.plan.role(role)?;
        let index = index % assignment.queue_count;
        // Safety: the family and index come from the plan the device was
        // created with.
        let handle = unsafe { self.0.device.get_device_queue(assignment.family, index) };
        Some(Queue::from_raw(
            self.clone(),
            handle,
            assignment.family,
            index,
        ))
    }

    /// Locks one queue for submission. All submissions in this crate go
    /// through this; external code sharing the device must do the same.
    pub fn lock_queue(&self, family: u32, index: u32) -> QueueGuard<'_> {
        self.0.locks.lock(family, index)
    }

    #[cfg(unix)]
    pub(crate) fn memory_fd_fns(&self) -> Option<&ash::khr::external_memory_fd::Device> {
        self.0.external.memory_fd.as_ref()
    }

    #[cfg(unix)]
    pub(crate) fn semaphore_fd_fns(&self) -> Option<&ash::khr::external_semaphore_fd::Device> {
        self.0.external.semaphore_fd.as_ref()
    }

    #[cfg(unix)]
    pub(crate) fn drm_modifier_fns(&self) -> Option<&ash::ext::image_drm_format_modifier::Device> {
        self.0.external.drm_modifier.as_ref()
    }

    pub(crate) fn host_import_fns(&self) -> Option<&ash::ext::external_memory_host::Device> {
        self.0.external.host_import.as_ref()
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}
impl AsVkHandle for Device {
    type Handle = vk::Device;

    fn vk_handle(&self) -> Self::Handle {
        self.0.device.handle()
    }
}
impl HasDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        // Safety: we have &mut self and therefore exclusive control of the
        // device. Queue and resource wrappers retain an Arc to the device,
        // so none outlive this point.
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// Replacement lock/unlock callbacks for queue serialization.
pub type QueueLockFn = dyn Fn(u32, u32) + Send + Sync;

struct QueueLocks {
    /// Outer index: queue family. Inner: queue index within the family.
    /// Sized once at device creation, never resized.
    table: Box<[Box<[Mutex<()>]>]>,
    hooks: Option<(Box<QueueLockFn>, Box<QueueLockFn>)>,
}

impl QueueLocks {
    fn lock(&self, family: u32, index: u32) -> QueueGuard<'_> {
        let held = match &self.hooks {
            Some((lock, _)) => {
                lock(family, index);
                None
            }
            None => Some(self.table[family as usize][index as usize].lock().unwrap()),
        };
        QueueGuard {
            locks: self,
            family,
            index,
            held,
        }
    }
}

/// Exclusive access to one queue; released on drop.
pub struct QueueGuard<'a> {
    locks: &'a QueueLocks,
    family: u32,
    index: u32,
    held: Option<MutexGuard<'a, ()>>,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if self.held.take().is_none() {
            if let Some((_, unlock)) = &self.locks.hooks {
                unlock(self.family, self.index);
            }
        }
    }
}

fn queue_lock_table(families: &[vk::QueueFamilyProperties]) -> Box<[Box<[Mutex<()>]>]> {
    families
        .iter()
        .map(|f| (0..f.queue_count).map(|_| Mutex::new(())).collect())
        .collect()
}

/// A builder for Vulkan logical devices.
pub struct DeviceBuilder {
    physical_device: PhysicalDevice,
    families: Vec<vk::QueueFamilyProperties>,
    features: DeviceFeatures,
    timeline_supported: bool,
    enabled_extensions: BTreeSet<CString>,
    lock_hooks: Option<(Box<QueueLockFn>, Box<QueueLockFn>)>,
    linear_images: bool,
    disable_multiplane: bool,
}
// The feature blocks never carry live chain pointers between calls.
unsafe impl Send for DeviceBuilder {}
unsafe impl Sync for DeviceBuilder {}

impl DeviceBuilder {
    /// Queries features and extension support, and pre-enables every entry of
    /// [`OPTIONAL_DEVICE_EXTENSIONS`] the driver advertises.
    pub fn new(physical_device: PhysicalDevice) -> Self {
        let (supported, timeline_supported) = DeviceFeatures::query(&physical_device);
        let features = DeviceFeatures::curated(&supported);
        let families = physical_device.queue_family_properties();

        let mut enabled_extensions = BTreeSet::new();
        for &name in OPTIONAL_DEVICE_EXTENSIONS {
            if physical_device.supports_extension(name) {
                tracing::debug!(extension = ?name, "using device extension");
                enabled_extensions.insert(name.to_owned());
            }
        }
        if enabled_extensions.contains(ash::khr::portability_subset::NAME) {
            tracing::warn!("running on a Vulkan portability implementation");
        }

        Self {
            physical_device,
            families,
            features,
            timeline_supported,
            enabled_extensions,
            lock_hooks: None,
            linear_images: false,
            disable_multiplane: false,
        }
    }

    /// Enables a device extension if the driver advertises it.
    ///
    /// Returns whether the extension will be enabled. Unknown names are
    /// logged and skipped.
    pub fn enable_extension(&mut self, name: &CStr) -> bool {
        if self.physical_device.supports_extension(name) {
            tracing::debug!(extension = ?name, "using device extension");
            self.enabled_extensions.insert(name.to_owned());
            true
        } else {
            tracing::warn!(extension = ?name, "device extension not found, excluding");
            false
        }
    }

    /// Applies [`ContextOptions`] to the builder.
    pub fn apply_options(&mut self, options: &ContextOptions) -> &mut Self {
        self.linear_images = options.linear_images;
        self.disable_multiplane = options.disable_multiplane;
        for name in &options.device_extensions {
            match CString::new(name.as_str()) {
                Ok(name) => {
                    self.enable_extension(&name);
                }
                Err(_) => tracing::warn!(extension = name, "invalid extension name, excluding"),
            }
        }
        self
    }

    /// Replaces the internal queue mutex table, for hosts that already
    /// serialize access to the queues of this device.
    pub fn queue_lock_hooks(
        &mut self,
        lock: impl Fn(u32, u32) + Send + Sync + 'static,
        unlock: impl Fn(u32, u32) + Send + Sync + 'static,
    ) -> &mut Self {
        self.lock_hooks = Some((Box::new(lock), Box::new(unlock)));
        self
    }

    /// Plans queues and creates the logical device.
    ///
    /// Fails with [`Error::MissingRequiredFeature`] when the device lacks
    /// timeline semaphores; every frame operation synchronizes through them.
    pub fn build(mut self) -> Result<Device> {
        if !self.timeline_supported {
            tracing::error!("device does not support timeline semaphores");
            return Err(Error::MissingRequiredFeature("timelineSemaphore"));
        }

        let plan = QueuePlan::plan(&self.families)?;
        let queue_infos = plan
            .families
            .iter()
            .map(|f| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(f.index)
                    .queue_priorities(&f.priorities)
            })
            .collect::<Vec<_>>();
        let extension_names = self
            .enabled_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();

        let mut features2 = self.features.chain();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        // Safety: no host synchronization rules for vkCreateDevice; the
        // create info chain points at locals and builder fields.
        let device = unsafe {
            self.physical_device.instance().create_device(
                self.physical_device.vk_handle(),
                &create_info,
                None,
            )
        }
        .map_err(|ret| {
            tracing::error!(result = ?ret, "device creation failure");
            VulkanError(ret)
        })?;
        self.features.unlink();

        let properties = self.physical_device.properties();
        tracing::debug!(
            device = %properties.device_name().to_string_lossy(),
            "using device"
        );
        tracing::debug!(
            row_pitch = properties.limits.optimal_buffer_copy_row_pitch_alignment,
            map = properties.limits.min_memory_map_alignment,
            non_coherent_atom = properties.limits.non_coherent_atom_size,
            host_import = properties.host_import_alignment(),
            "alignments"
        );
        let is_nvidia = properties.vendor_id == 0x10de;
        let locks = QueueLocks {
            table: queue_lock_table(&self.families),
            hooks: self.lock_hooks,
        };

        let instance = self.physical_device.instance();
        let loaded = |name: &CStr| self.enabled_extensions.contains(name);
        let external = ExternalFns {
            #[cfg(unix)]
            memory_fd: loaded(ash::khr::external_memory_fd::NAME)
                .then(|| ash::khr::external_memory_fd::Device::new(instance, &device)),
            #[cfg(unix)]
            semaphore_fd: loaded(ash::khr::external_semaphore_fd::NAME)
                .then(|| ash::khr::external_semaphore_fd::Device::new(instance, &device)),
            #[cfg(unix)]
            drm_modifier: loaded(ash::ext::image_drm_format_modifier::NAME)
                .then(|| ash::ext::image_drm_format_modifier::Device::new(instance, &device)),
            host_import: loaded(ash::ext::external_memory_host::NAME)
                .then(|| ash::ext::external_memory_host::Device::new(instance, &device)),
        };

        Ok(Device(Arc::new(DeviceInner {
            physical_device: self.physical_device,
            device,
            enabled_extensions: self.enabled_extensions,
            features: self.features,
            plan,
            locks,
            external,
            is_nvidia,
            linear_images: self.linear_images,
            disable_multiplane: self.disable_multiplane,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn curation_copies_only_vetted_features() {
        let mut supported = DeviceFeatures::default();
        supported.core.robust_buffer_access = vk::TRUE;
        supported.core.shader_int64 = vk::TRUE;
        supported.v12.buffer_device_address = vk::TRUE;
        supported.v12.descriptor_indexing = vk::TRUE;
        supported.v13.synchronization2 = vk::TRUE;

        let enabled = DeviceFeatures::curated(&supported);
        assert_eq!(enabled.core.shader_int64, vk::TRUE);
        assert_eq!(enabled.v12.buffer_device_address, vk::TRUE);
        assert_eq!(enabled.v13.synchronization2, vk::TRUE);
        // Unvetted flags stay off even when supported.
        assert_eq!(enabled.core.robust_buffer_access, vk::FALSE);
        assert_eq!(enabled.v12.descriptor_indexing, vk::FALSE);
    }

    #[test]
    fn timeline_semaphores_are_always_requested() {
        let enabled = DeviceFeatures::curated(&DeviceFeatures::default());
        assert_eq!(enabled.v12.timeline_semaphore, vk::TRUE);
    }

    #[test]
    fn lock_table_matches_family_sizes() {
        let families = [
            vk::QueueFamilyProperties {
                queue_count: 3,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_count: 1,
                ..Default::default()
            },
        ];
        let table = queue_lock_table(&families);
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].len(), 3);
        assert_eq!(table[1].len(), 1);
    }

    #[test]
    fn hooks_replace_internal_mutexes() {
        static LOCKS: AtomicU32 = AtomicU32::new(0);
        static UNLOCKS: AtomicU32 = AtomicU32::new(0);
        let locks = QueueLocks {
            table: Box::new([]),
            hooks: Some((
                Box::new(|family, index| {
                    assert_eq!((family, index), (2, 1));
                    LOCKS.fetch_add(1, Ordering::SeqCst);
                }),
                Box::new(|family, index| {
                    assert_eq!((family, index), (2, 1));
                    UNLOCKS.fetch_add(1, Ordering::SeqCst);
                }),
            )),
        };
        {
            let _guard = locks.lock(2, 1);
            assert_eq!(LOCKS.load(Ordering::SeqCst), 1);
            assert_eq!(UNLOCKS.load(Ordering::SeqCst), 0);
        }
        assert_eq!(UNLOCKS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn optional_extension_table_has_no_duplicates() {
        let unique = OPTIONAL_DEVICE_EXTENSIONS
            .iter()
            .collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), OPTIONAL_DEVICE_EXTENSIONS.len());
    }
}
