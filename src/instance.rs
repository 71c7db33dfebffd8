//! Instance bootstrap.
//!
//! This module provides [`ContextOptions`] for the string-keyed configuration
//! accepted at context creation, and the [`Instance`] type with its builder.
//!
//! The instance is the connection between the library and the Vulkan loader.
//! Creating one resolves the driver entry point, negotiates validation layers
//! and instance extensions, and optionally installs a diagnostic callback that
//! forwards driver messages to `tracing`.
//!
//! Layer selection and debug mode are independent controls: requesting a
//! validation layer by name never flips debug mode on, and `debug` works
//! without naming any layer. Unknown layer or extension names are logged and
//! skipped. The one exception is the debug-utils extension itself, which is a
//! hard failure when debug mode was explicitly requested, so that diagnostics
//! never silently vanish.

use ash::vk;
use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
    ffi::{c_void, CStr, CString},
    ops::Deref,
    sync::Arc,
};

use crate::error::{Error, Result, VulkanError};
use crate::utils::Version;

/// String-keyed configuration accepted at context creation.
///
/// All keys are optional. List-valued keys are `+`-delimited.
#[derive(Clone, Debug, Default)]
pub struct ContextOptions {
    /// Enables the standard validation layer, extended validation features and
    /// the diagnostic callback.
    pub debug: bool,
    /// Extra validation layers to enable, by name.
    pub validation_layers: Vec<String>,
    /// Extra instance extensions to enable, by name.
    pub instance_extensions: Vec<String>,
    /// Extra device extensions to enable, by name.
    pub device_extensions: Vec<String>,
    /// Forces linear tiling for created images.
    pub linear_images: bool,
    /// Forces the per-plane fallback representation for all formats.
    pub disable_multiplane: bool,
}

impl ContextOptions {
    /// Parses options out of a key/value dictionary. Unknown keys are ignored
    /// so the map may be shared with other consumers.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut opts = Self::default();
        for (key, value) in pairs {
            match key {
                "debug" => opts.debug = parse_flag(value),
                "validation_layers" => opts.validation_layers = parse_list(value),
                "instance_extensions" => opts.instance_extensions = parse_list(value),
                "device_extensions" => opts.device_extensions = parse_list(value),
                "linear_images" => opts.linear_images = parse_flag(value),
                "disable_multiplane" => opts.disable_multiplane = parse_flag(value),
                _ => {}
            }
        }
        opts
    }
}

fn parse_flag(value: &str) -> bool {
    value.parse::<i64>().map(|n| n != 0).unwrap_or(false)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split('+')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Loads the Vulkan driver library.
///
/// The loader probes the platform's library name list in priority order;
/// failure to locate any candidate maps to [`Error::DriverNotFound`].
pub fn load_driver() -> Result<Arc<ash::Entry>> {
    // Safety: the entry point table is only used while the returned Arc is
    // alive, and the library is never unloaded before then.
    let entry = unsafe { ash::Entry::load() }?;
    Ok(Arc::new(entry))
}

pub const DEFAULT_VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions enabled automatically whenever the driver offers them.
const OPTIONAL_INSTANCE_EXTENSIONS: &[&CStr] = &[ash::khr::portability_enumeration::NAME];

/// A Vulkan instance wrapper.
///
/// Reference-counted for cheap shared access; the underlying instance is
/// destroyed when the last reference drops.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Instance {}

struct InstanceInner {
    entry: Arc<ash::Entry>,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    enabled_extensions: BTreeSet<CString>,
    api_version: Version,
}

struct DebugMessenger {
    fns: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

/// Application metadata passed to instance creation.
pub struct InstanceCreateInfo {
    pub flags: vk::InstanceCreateFlags,
    pub application_name: Cow<'static, CStr>,
    pub application_version: Version,
    pub engine_name: Cow<'static, CStr>,
    pub engine_version: Version,
    pub api_version: Version,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            flags: vk::InstanceCreateFlags::empty(),
            application_name: Cow::Borrowed(c"vkframe"),
            application_version: Default::default(),
            engine_name: Cow::Borrowed(c"vkframe"),
            engine_version: Default::default(),
            api_version: Version::V1_3,
        }
    }
}

impl Instance {
    /// Creates a new instance builder.
    pub fn builder(entry: Arc<ash::Entry>) -> Result<InstanceBuilder> {
        InstanceBuilder::new(entry)
    }

    /// Bootstraps an instance directly from parsed options.
    pub fn create(entry: Arc<ash::Entry>, options: &ContextOptions) -> Result<Instance> {
        let mut builder = InstanceBuilder::new(entry)?;
        builder.apply_options(options)?;
        builder.build()
    }

    pub fn entry(&self) -> &Arc<ash::Entry> {
        &self.0.entry
    }

    pub fn api_version(&self) -> Version {
        self.0.api_version
    }

    /// Whether an instance extension was enabled at creation.
    pub fn extension_enabled(&self, name: &CStr) -> bool {
        self.0.enabled_extensions.contains(name)
    }

    pub fn debug_enabled(&self) -> bool {
        self.0.debug_messenger.is_some()
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.0.instance
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.instance.handle(), "drop instance");
        // Safety: we hold &mut self, so no other host access to the instance
        // or to anything created from it remains.
        unsafe {
            if let Some(messenger) = self.debug_messenger.take() {
                messenger
                    .fns
                    .destroy_debug_utils_messenger(messenger.handle, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// A builder that negotiates layers and extensions before instance creation.
pub struct InstanceBuilder {
    entry: Arc<ash::Entry>,
    available_extensions: BTreeMap<CString, Version>,
    available_layers: BTreeSet<CString>,
    enabled_extensions: BTreeSet<CString>,
    enabled_layers: Vec<CString>,
    debug: bool,

    /// Application metadata. Modify before [`InstanceBuilder::build`].
    pub info: InstanceCreateInfo,
}

impl InstanceBuilder {
    /// Enumerates available extensions and layers from the Vulkan loader.
    pub fn new(entry: Arc<ash::Entry>) -> Result<Self> {
        // Safety: enumeration calls have no host synchronization rules.
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(VulkanError)?
            .into_iter()
            .filter_map(|ext| {
                let name = ext.extension_name_as_c_str().ok()?;
                Some((name.to_owned(), Version(ext.spec_version)))
            })
            .collect::<BTreeMap<CString, Version>>();
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .map_err(VulkanError)?
            .into_iter()
            .filter_map(|layer| Some(layer.layer_name_as_c_str().ok()?.to_owned()))
            .collect::<BTreeSet<CString>>();

        let mut this = Self {
            entry,
            available_extensions,
            available_layers,
            enabled_extensions: BTreeSet::new(),
            enabled_layers: Vec::new(),
            debug: false,
            info: InstanceCreateInfo::default(),
        };
        for &name in OPTIONAL_INSTANCE_EXTENSIONS {
            this.enable_extension(name);
        }
        #[cfg(target_vendor = "apple")]
        if this
            .enabled_extensions
            .contains(ash::khr::portability_enumeration::NAME)
        {
            // Allow the enumeration of non-conformant implementations.
            this.info.flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }
        Ok(this)
    }

    /// Enables an instance extension if the loader advertises it.
    ///
    /// Returns whether the extension will be enabled. Unknown names are
    /// logged and skipped.
    pub fn enable_extension(&mut self, name: &CStr) -> bool {
        if self.available_extensions.contains_key(name) {
            tracing::trace!(extension = ?name, "using instance extension");
            self.enabled_extensions.insert(name.to_owned());
            true
        } else {
            tracing::warn!(extension = ?name, "instance extension not found, excluding");
            false
        }
    }

    /// Enables a validation layer if the loader advertises it.
    pub fn enable_layer(&mut self, name: &CStr) -> bool {
        if self.available_layers.contains(name) {
            tracing::trace!(layer = ?name, "requested validation layer");
            if !self.enabled_layers.iter().any(|l| l.as_c_str() == name) {
                self.enabled_layers.push(name.to_owned());
            }
            true
        } else {
            tracing::warn!(layer = ?name, "validation layer not supported, excluding");
            false
        }
    }

    /// Turns on debug mode: the standard validation layer when present, the
    /// debug-utils extension, extended validation features and the diagnostic
    /// callback.
    ///
    /// Fails with [`Error::MissingRequiredFeature`] if the debug-utils
    /// extension is unavailable; explicitly requested diagnostics do not
    /// silently vanish.
    pub fn enable_debug(&mut self) -> Result<()> {
        if !self
            .available_extensions
            .contains_key(ash::ext::debug_utils::NAME)
        {
            tracing::error!(
                extension = ?ash::ext::debug_utils::NAME,
                "debug requested but the debug extension was not found"
            );
            return Err(Error::MissingRequiredFeature("VK_EXT_debug_utils"));
        }
        self.enabled_extensions
            .insert(ash::ext::debug_utils::NAME.to_owned());
        if self.available_layers.contains(DEFAULT_VALIDATION_LAYER) {
            tracing::trace!(layer = ?DEFAULT_VALIDATION_LAYER, "default validation layer is enabled");
            self.enable_layer(DEFAULT_VALIDATION_LAYER);
        } else {
            tracing::warn!("default validation layer not present, continuing without");
        }
        self.debug = true;
        Ok(())
    }

    /// Applies [`ContextOptions`] to the builder.
    pub fn apply_options(&mut self, options: &ContextOptions) -> Result<()> {
        if tracing::enabled!(tracing::Level::TRACE) {
            for layer in &self.available_layers {
                tracing::trace!(layer = ?layer, "supported validation layer");
            }
        }
        if options.debug {
            self.enable_debug()?;
        }
        for name in &options.validation_layers {
            match CString::new(name.as_str()) {
                Ok(name) => {
                    self.enable_layer(&name);
                }
                Err(_) => tracing::warn!(layer = name, "invalid layer name, excluding"),
            }
        }
        for name in &options.instance_extensions {
            match CString::new(name.as_str()) {
                Ok(name) => {
                    self.enable_extension(&name);
                }
                Err(_) => tracing::warn!(extension = name, "invalid extension name, excluding"),
            }
        }
        Ok(())
    }

    /// Creates the instance, and the diagnostic messenger when debug mode is
    /// on.
    pub fn build(self) -> Result<Instance> {
        let application_info = vk::ApplicationInfo {
            p_application_name: self.info.application_name.as_ptr(),
            application_version: self.info.application_version.0,
            p_engine_name: self.info.engine_name.as_ptr(),
            engine_version: self.info.engine_version.0,
            api_version: self.info.api_version.0,
            ..Default::default()
        };

        let layer_names = self
            .enabled_layers
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();
        let extension_names = self
            .enabled_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();

        let validation_feature_list = [
            vk::ValidationFeatureEnableEXT::GPU_ASSISTED,
            vk::ValidationFeatureEnableEXT::GPU_ASSISTED_RESERVE_BINDING_SLOT,
            vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
        ];
        let mut validation_features =
            vk::ValidationFeaturesEXT::default().enabled_validation_features(&validation_feature_list);

        let mut create_info = vk::InstanceCreateInfo {
            p_application_info: &application_info,
            flags: self.info.flags,
            ..Default::default()
        }
        .enabled_layer_names(&layer_names)
        .enabled_extension_names(&extension_names);
        if self.debug {
            create_info = create_info.push_next(&mut validation_features);
        }

        // Safety: no host synchronization rules for vkCreateInstance.
        let instance = unsafe { self.entry.create_instance(&create_info, None) }.map_err(|ret| {
            tracing::error!(result = ?ret, "instance creation failure");
            VulkanError(ret)
        })?;

        let debug_messenger = if self.debug {
            match install_messenger(&self.entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    // Safety: nothing else references the fresh instance yet.
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        Ok(Instance(Arc::new(InstanceInner {
            entry: self.entry,
            instance,
            debug_messenger,
            enabled_extensions: self.enabled_extensions,
            api_version: self.info.api_version,
        })))
    }
}

fn install_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<DebugMessenger, VulkanError> {
    let fns = ash::ext::debug_utils::Instance::new(entry, instance);
    let info = vk::DebugUtilsMessengerCreateInfoEXT {
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    // Safety: the callback outlives the messenger and takes no user data.
    let handle = unsafe { fns.create_debug_utils_messenger(&info, None) }.map_err(VulkanError)?;
    Ok(DebugMessenger { fns, handle })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let data = &*data;
    let message = if data.p_message.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };
    let labels = if data.cmd_buf_label_count > 0 && !data.p_cmd_buf_labels.is_null() {
        std::slice::from_raw_parts(data.p_cmd_buf_labels, data.cmd_buf_label_count as usize)
            .iter()
            .filter(|label| !label.p_label_name.is_null())
            .map(|label| CStr::from_ptr(label.p_label_name).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(?labels, "{message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => tracing::info!(?labels, "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => tracing::warn!(?labels, "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => tracing::error!(?labels, "{message}"),
        _ => tracing::debug!(?labels, "{message}"),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_from_pairs() {
        let opts = ContextOptions::from_pairs([
            ("debug", "1"),
            ("validation_layers", "VK_LAYER_one+VK_LAYER_two"),
            ("instance_extensions", "VK_EXT_foo"),
            ("linear_images", "1"),
            ("unrelated_key", "whatever"),
        ]);
        assert!(opts.debug);
        assert_eq!(opts.validation_layers, ["VK_LAYER_one", "VK_LAYER_two"]);
        assert_eq!(opts.instance_extensions, ["VK_EXT_foo"]);
        assert!(opts.linear_images);
        assert!(!opts.disable_multiplane);
        assert!(opts.device_extensions.is_empty());
    }

    #[test]
    fn flag_values_are_integers() {
        assert!(parse_flag("1"));
        assert!(parse_flag("2"));
        assert!(parse_flag("-1"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
        assert!(!parse_flag("yes"));
    }

    #[test]
    fn empty_list_segments_are_dropped() {
        assert_eq!(parse_list("a++b+"), ["a", "b"]);
        assert!(parse_list("").is_empty());
        assert!(parse_list("+").is_empty());
    }

    #[test]
    fn debug_and_layers_stay_independent() {
        let opts = ContextOptions::from_pairs([(
            "validation_layers",
            "VK_LAYER_KHRONOS_validation",
        )]);
        // Naming the default layer must not flip debug mode on.
        assert!(!opts.debug);

        let opts = ContextOptions::from_pairs([("debug", "1")]);
        assert!(opts.debug);
        assert!(opts.validation_layers.is_empty());
    }
}
