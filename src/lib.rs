//! # vkframe
//!
//! Vulkan device and frame management for hardware-accelerated video
//! pipelines.
//!
//! vkframe covers the plumbing a Vulkan video integration needs before the
//! first decoded pixel shows up: driver loading, instance and device
//! negotiation, queue-family planning, multi-planar frame allocation with
//! format fallback, host transfers, and frame hand-off to other APIs over
//! POSIX fds. It is deliberately not a renderer; frames, their memory and
//! their timeline semaphores are the product.
//!
//! ## Quick Start
//!
//! ```no_run
//! use vkframe::{
//!     ContextOptions, Device, DeviceSelector, FramesContext, FramesOptions, Instance,
//!     PhysicalDevice, PixelFormat,
//! };
//!
//! let options = ContextOptions::default();
//! let entry = vkframe::load_driver().unwrap();
//! let instance = Instance::create(entry, &options).unwrap();
//! let physical = PhysicalDevice::select(&instance, &DeviceSelector::default()).unwrap();
//! let device = Device::create(physical, &options).unwrap();
//!
//! // A source of 1920x1080 NV12 frames.
//! let frames = FramesContext::new(&device, FramesOptions::new(PixelFormat::Nv12, 1920, 1080))
//!     .unwrap();
//! let frame = frames.alloc().unwrap();
//! ```
//!
//! ## Overview
//!
//! ### Instance and device
//!
//! [`ContextOptions`] carries the user-facing knobs (`debug`, extension
//! lists, `linear_images`, ...) parsed from a key/value dictionary.
//! [`Instance::create`] and [`Device::create`] negotiate layers and
//! extensions against what the driver actually offers, warn and skip
//! anything absent, and fail only on capabilities this crate cannot work
//! without. [`instance::InstanceBuilder`] and [`device::DeviceBuilder`]
//! sit underneath for callers that need finer control, and
//! [`DeviceSelector`] picks one GPU among several by UUID, DRM node, name,
//! PCI ids or index.
//!
//! ### Frames
//!
//! A [`FramesContext`] resolves a [`PixelFormat`] into a concrete image
//! representation once (a single multi-planar image where the device
//! supports it well, one image per plane otherwise) and then stamps out
//! [`Frame`]s: images, backing memory, and one timeline semaphore per image
//! tracking every pending operation. Frame operations wait for and advance
//! those semaphores, so a frame crosses queue, thread and API boundaries
//! without host/device races.
//!
//! ### Transfers
//!
//! [`FramesContext::upload`] and [`FramesContext::download`] move pixel
//! rows between host slices and frame images through per-plane staging
//! buffers on the transfer queue. Host allocations that satisfy the
//! driver's import rules are wrapped directly and skip the staging copy.
//!
//! ### Interop
//!
//! On unix, the `interop` module exports frames to external compute APIs as
//! opaque fds (`FramesContext::export_to`) with explicit wait/signal
//! handoff windows, and converts frames to and from DRM PRIME descriptors
//! (`FramesContext::import_drm`, `FramesContext::export_drm`) for zero-copy
//! exchange with other DRM consumers.
//!
//! ## Requirements
//!
//! Vulkan 1.3 with timeline semaphores. Everything beyond that is probed
//! per device and degrades feature by feature.

mod alloc;
pub mod device;
pub mod error;
pub mod exec;
pub mod format;
pub mod frame;
pub mod instance;
#[cfg(unix)]
pub mod interop;
pub mod physical_device;
pub mod probe;
pub mod queue;
pub mod sync;
pub mod transfer;
pub mod utils;

pub use device::{Device, HasDevice};
pub use error::{Error, Result, VulkanError};
pub use format::PixelFormat;
pub use frame::{Frame, FramesContext, FramesOptions};
pub use instance::{load_driver, ContextOptions, Instance};
pub use physical_device::{DeviceSelector, PhysicalDevice};
pub use queue::Queue;

pub use ash;

pub mod prelude {
    pub use crate::{
        ash,
        ash::vk,
        transfer::{HostPlane, HostPlaneMut},
        utils::AsVkHandle,
        ContextOptions, Device, DeviceSelector, Frame, FramesContext, FramesOptions, HasDevice,
        Instance, PhysicalDevice, PixelFormat,
    };
}
