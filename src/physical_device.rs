//! Physical device enumeration, selection and properties.
//!
//! A physical device represents one GPU. Devices are enumerated from an
//! [`Instance`], matched against a [`DeviceSelector`], and used to query
//! capabilities before creating a logical [`Device`](crate::Device).
//!
//! Selection honors exactly one criterion, in strict priority order: device
//! UUID, DRM node numbers, name substring, device id, vendor id, positional
//! index. A present-but-unmatched criterion is an error rather than a
//! fallthrough, so a typo can never silently pick a different GPU.

use ash::vk;
use std::{
    collections::BTreeMap,
    ffi::{CStr, CString},
    ops::Deref,
    sync::Arc,
};

use crate::error::{Error, Result, VulkanError};
use crate::format::{self, PixelFormat};
use crate::instance::Instance;
use crate::probe::{self, FormatPlan, ResolveFlags};
use crate::utils::{AsVkHandle, Version};

/// A GPU known to the instance.
///
/// Reference-counted and cheap to clone. Carries an eagerly queried property
/// cache so capability checks never re-enter the driver.
#[derive(Clone)]
pub struct PhysicalDevice(Arc<PhysicalDeviceInner>);
impl PartialEq for PhysicalDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PhysicalDevice {}

struct PhysicalDeviceInner {
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    properties: PhysicalDeviceProperties,
}

impl Instance {
    /// Enumerates all physical devices visible to this instance.
    pub fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        // Safety: no host synchronization rules for enumeration.
        let pdevices =
            unsafe { self.deref().enumerate_physical_devices() }.map_err(VulkanError)?;
        pdevices
            .into_iter()
            .map(|pdevice| {
                let properties = PhysicalDeviceProperties::new(self, pdevice)?;
                Ok(PhysicalDevice(Arc::new(PhysicalDeviceInner {
                    instance: self.clone(),
                    physical_device: pdevice,
                    properties,
                })))
            })
            .collect()
    }
}

impl AsVkHandle for PhysicalDevice {
    type Handle = vk::PhysicalDevice;

    fn vk_handle(&self) -> Self::Handle {
        self.0.physical_device
    }
}

impl PhysicalDevice {
    /// Picks a device matching `selector` from everything the instance sees.
    pub fn select(instance: &Instance, selector: &DeviceSelector) -> Result<PhysicalDevice> {
        let devices = instance.enumerate_physical_devices()?;
        if devices.is_empty() {
            tracing::error!("no devices found");
            return Err(Error::NoDevice("no devices found".into()));
        }

        tracing::trace!("GPU listing:");
        let records = devices
            .iter()
            .enumerate()
            .map(|(i, dev)| {
                let props = dev.properties();
                tracing::trace!(
                    index = i,
                    name = %props.device_name().to_string_lossy(),
                    kind = device_type_str(props.device_type),
                    device_id = format_args!("{:#x}", props.device_id),
                    "    candidate"
                );
                props.selection_record()
            })
            .collect::<Vec<_>>();

        let choice = choose(&records, selector)?;
        let props = devices[choice].properties();
        tracing::trace!(
            index = choice,
            name = %props.device_name().to_string_lossy(),
            kind = device_type_str(props.device_type),
            device_id = format_args!("{:#x}", props.device_id),
            "device selected"
        );
        Ok(devices[choice].clone())
    }

    pub fn instance(&self) -> &Instance {
        &self.0.instance
    }

    pub fn properties(&self) -> &PhysicalDeviceProperties {
        &self.0.properties
    }

    /// Whether the device advertises the given extension.
    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.0.properties.extensions.contains_key(name)
    }

    pub fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.0
                .instance
                .get_physical_device_queue_family_properties(self.0.physical_device)
        }
    }

    /// Format feature flags for `format` under the given tiling mode.
    pub fn format_features(
        &self,
        vk_format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> vk::FormatFeatureFlags2 {
        let mut props3 = vk::FormatProperties3::default();
        let mut props2 = vk::FormatProperties2::default().push_next(&mut props3);
        unsafe {
            self.0.instance.get_physical_device_format_properties2(
                self.0.physical_device,
                vk_format,
                &mut props2,
            );
        }
        match tiling {
            vk::ImageTiling::LINEAR => props3.linear_tiling_features,
            _ => props3.optimal_tiling_features,
        }
    }

    /// Resolves a logical format to the representation this device supports.
    pub fn resolve_format(
        &self,
        pixfmt: PixelFormat,
        tiling: vk::ImageTiling,
        flags: ResolveFlags,
    ) -> Result<FormatPlan> {
        let entry = format::lookup(pixfmt)
            .ok_or_else(|| Error::Unsupported(format!("unknown pixel format {pixfmt:?}")))?;
        probe::resolve_with(entry, tiling, flags, |f| self.format_features(f, tiling))
    }

    /// Every logical format with a usable representation under `tiling`.
    pub fn supported_formats(&self, tiling: vk::ImageTiling) -> Vec<PixelFormat> {
        format::FORMAT_TABLE
            .iter()
            .filter(|entry| {
                probe::resolve_with(entry, tiling, ResolveFlags::default(), |f| {
                    self.format_features(f, tiling)
                })
                .is_ok()
            })
            .map(|entry| entry.format)
            .collect()
    }

    /// Queries support for an image configuration, including external-handle
    /// capabilities when `format_info` chains an external image format query.
    pub fn image_format_properties(
        &self,
        format_info: &vk::PhysicalDeviceImageFormatInfo2,
        out: &mut vk::ImageFormatProperties2,
    ) -> Result<bool> {
        unsafe {
            match self.0.instance.get_physical_device_image_format_properties2(
                self.0.physical_device,
                format_info,
                out,
            ) {
                Ok(()) => Ok(true),
                Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(false),
                Err(ret) => Err(VulkanError(ret).into()),
            }
        }
    }
}

/// Eagerly cached device properties.
///
/// Derefs to the core [`vk::PhysicalDeviceProperties`] for limits access.
pub struct PhysicalDeviceProperties {
    inner: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    extensions: BTreeMap<CString, Version>,
    device_uuid: [u8; vk::UUID_SIZE],
    drm_primary: Option<(i64, i64)>,
    drm_render: Option<(i64, i64)>,
    host_import_alignment: Option<u64>,
}

impl PhysicalDeviceProperties {
    fn new(instance: &Instance, pdevice: vk::PhysicalDevice) -> Result<Self> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(pdevice) }
            .map_err(VulkanError)?
            .into_iter()
            .filter_map(|ext| {
                let name = ext.extension_name_as_c_str().ok()?;
                Some((name.to_owned(), Version(ext.spec_version)))
            })
            .collect::<BTreeMap<CString, Version>>();

        let has_drm = extensions.contains_key(ash::ext::physical_device_drm::NAME);
        let has_host_import = extensions.contains_key(ash::ext::external_memory_host::NAME);

        let mut id_props = vk::PhysicalDeviceIDProperties::default();
        let mut drm_props = vk::PhysicalDeviceDrmPropertiesEXT::default();
        let mut host_props = vk::PhysicalDeviceExternalMemoryHostPropertiesEXT::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut id_props);
        if has_drm {
            props2 = props2.push_next(&mut drm_props);
        }
        if has_host_import {
            props2 = props2.push_next(&mut host_props);
        }
        unsafe {
            instance.get_physical_device_properties2(pdevice, &mut props2);
        }
        let inner = props2.properties;
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(pdevice) };

        Ok(Self {
            inner,
            memory_properties,
            extensions,
            device_uuid: id_props.device_uuid,
            drm_primary: (has_drm && drm_props.has_primary != vk::FALSE)
                .then_some((drm_props.primary_major, drm_props.primary_minor)),
            drm_render: (has_drm && drm_props.has_render != vk::FALSE)
                .then_some((drm_props.render_major, drm_props.render_minor)),
            host_import_alignment: has_host_import
                .then_some(host_props.min_imported_host_pointer_alignment),
        })
    }

    pub fn device_name(&self) -> &CStr {
        self.inner.device_name_as_c_str().unwrap_or(c"unknown")
    }

    pub fn api_version(&self) -> Version {
        Version(self.inner.api_version)
    }

    pub fn device_uuid(&self) -> [u8; vk::UUID_SIZE] {
        self.device_uuid
    }

    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory_properties.memory_types
            [0..self.memory_properties.memory_type_count as usize]
    }

    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_properties.memory_heaps
            [0..self.memory_properties.memory_heap_count as usize]
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Minimum alignment for imported host pointers, when the device supports
    /// host-memory import at all.
    pub fn host_import_alignment(&self) -> Option<u64> {
        self.host_import_alignment
    }

    fn selection_record(&self) -> SelectionRecord {
        SelectionRecord {
            name: self.device_name().to_string_lossy().into_owned(),
            device_id: self.inner.device_id,
            vendor_id: self.inner.vendor_id,
            uuid: self.device_uuid,
            drm_primary: self.drm_primary,
            drm_render: self.drm_render,
        }
    }
}

impl Deref for PhysicalDeviceProperties {
    type Target = vk::PhysicalDeviceProperties;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

fn device_type_str(kind: vk::PhysicalDeviceType) -> &'static str {
    match kind {
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "software",
        _ => "unknown",
    }
}

/// Criteria for picking one GPU among several.
///
/// Exactly one criterion applies, in field order; `index` is the final
/// fallback and defaults to the first device.
#[derive(Clone, Debug, Default)]
pub struct DeviceSelector {
    pub uuid: Option<[u8; vk::UUID_SIZE]>,
    /// DRM node major/minor numbers; matches either the primary or the
    /// render node.
    pub drm_node: Option<(u32, u32)>,
    /// Case-insensitive substring of the advertised device name.
    pub name: Option<String>,
    pub device_id: Option<u32>,
    pub vendor_id: Option<u32>,
    pub index: usize,
}

impl DeviceSelector {
    /// Parses a user-facing device string: a bare integer selects by index,
    /// anything else matches the device name.
    pub fn parse(device: &str) -> Self {
        match device.parse::<usize>() {
            Ok(index) => Self {
                index,
                ..Default::default()
            },
            Err(_) => Self {
                name: Some(device.to_owned()),
                ..Default::default()
            },
        }
    }
}

struct SelectionRecord {
    name: String,
    device_id: u32,
    vendor_id: u32,
    uuid: [u8; vk::UUID_SIZE],
    drm_primary: Option<(i64, i64)>,
    drm_render: Option<(i64, i64)>,
}

fn choose(records: &[SelectionRecord], selector: &DeviceSelector) -> Result<usize> {
    if let Some(uuid) = &selector.uuid {
        return records
            .iter()
            .position(|r| r.uuid == *uuid)
            .ok_or_else(|| Error::NoDevice("unable to find device by given UUID".into()));
    }
    if let Some((major, minor)) = selector.drm_node {
        let node = (i64::from(major), i64::from(minor));
        return records
            .iter()
            .position(|r| r.drm_primary == Some(node) || r.drm_render == Some(node))
            .ok_or_else(|| {
                Error::NoDevice(format!(
                    "unable to find device by given DRM node numbers {major}:{minor}"
                ))
            });
    }
    if let Some(name) = &selector.name {
        tracing::trace!(name, "requested device");
        let needle = name.to_lowercase();
        return records
            .iter()
            .position(|r| r.name.to_lowercase().contains(&needle))
            .ok_or_else(|| Error::NoDevice(format!("unable to find device \"{name}\"")));
    }
    if let Some(id) = selector.device_id {
        return records
            .iter()
            .position(|r| r.device_id == id)
            .ok_or_else(|| Error::NoDevice(format!("unable to find device with id {id:#x}")));
    }
    if let Some(vendor) = selector.vendor_id {
        return records
            .iter()
            .position(|r| r.vendor_id == vendor)
            .ok_or_else(|| {
                Error::NoDevice(format!("unable to find device with vendor id {vendor:#x}"))
            });
    }
    if selector.index < records.len() {
        Ok(selector.index)
    } else {
        Err(Error::NoDevice(format!(
            "unable to find device with index {}",
            selector.index
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, device_id: u32, vendor_id: u32, uuid_byte: u8) -> SelectionRecord {
        SelectionRecord {
            name: name.to_owned(),
            device_id,
            vendor_id,
            uuid: [uuid_byte; vk::UUID_SIZE],
            drm_primary: None,
            drm_render: None,
        }
    }

    fn sample() -> Vec<SelectionRecord> {
        vec![
            record("Mesa Intel(R) UHD Graphics", 0x9bc4, 0x8086, 1),
            record("NVIDIA GeForce RTX 3060", 0x2503, 0x10de, 2),
            record("AMD Radeon RX 6700", 0x73df, 0x1002, 3),
        ]
    }

    #[test]
    fn uuid_has_highest_priority() {
        let sel = DeviceSelector {
            uuid: Some([3; vk::UUID_SIZE]),
            name: Some("NVIDIA".into()),
            ..Default::default()
        };
        assert_eq!(choose(&sample(), &sel).unwrap(), 2);
    }

    #[test]
    fn unmatched_uuid_does_not_fall_through() {
        let sel = DeviceSelector {
            uuid: Some([9; vk::UUID_SIZE]),
            name: Some("NVIDIA".into()),
            ..Default::default()
        };
        assert!(matches!(choose(&sample(), &sel), Err(Error::NoDevice(_))));
    }

    #[test]
    fn name_match_is_case_insensitive_substring() {
        let sel = DeviceSelector {
            name: Some("radeon".into()),
            ..Default::default()
        };
        assert_eq!(choose(&sample(), &sel).unwrap(), 2);
    }

    #[test]
    fn drm_node_matches_primary_or_render() {
        let mut records = sample();
        records[1].drm_primary = Some((226, 0));
        records[1].drm_render = Some((226, 128));
        let by_primary = DeviceSelector {
            drm_node: Some((226, 0)),
            ..Default::default()
        };
        let by_render = DeviceSelector {
            drm_node: Some((226, 128)),
            ..Default::default()
        };
        assert_eq!(choose(&records, &by_primary).unwrap(), 1);
        assert_eq!(choose(&records, &by_render).unwrap(), 1);
    }

    #[test]
    fn id_then_vendor_then_index() {
        let by_id = DeviceSelector {
            device_id: Some(0x73df),
            ..Default::default()
        };
        assert_eq!(choose(&sample(), &by_id).unwrap(), 2);

        let by_vendor = DeviceSelector {
            vendor_id: Some(0x8086),
            ..Default::default()
        };
        assert_eq!(choose(&sample(), &by_vendor).unwrap(), 0);

        let by_index = DeviceSelector {
            index: 1,
            ..Default::default()
        };
        assert_eq!(choose(&sample(), &by_index).unwrap(), 1);

        let default = DeviceSelector::default();
        assert_eq!(choose(&sample(), &default).unwrap(), 0);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let sel = DeviceSelector {
            index: 7,
            ..Default::default()
        };
        assert!(matches!(choose(&sample(), &sel), Err(Error::NoDevice(_))));
    }

    #[test]
    fn device_string_parsing() {
        let sel = DeviceSelector::parse("2");
        assert_eq!(sel.index, 2);
        assert!(sel.name.is_none());

        let sel = DeviceSelector::parse("GeForce");
        assert_eq!(sel.name.as_deref(), Some("GeForce"));
        assert_eq!(sel.index, 0);
    }
}
