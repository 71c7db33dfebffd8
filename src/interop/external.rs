//! Opaque-handle export to compute APIs.
//!
//! A frame is exported at most once, to one [`PeerContext`]; the handles are
//! cached on the frame and handed back on every further call. Actual sharing
//! rounds are fenced by [`FramesContext::begin_external_access`] and
//! [`FramesContext::end_external_access`], which move image ownership across
//! the external-queue-family boundary and line the peer up on the frame's
//! timelines.

use std::fmt::Debug;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use ash::vk;

use crate::device::HasDevice;
use crate::error::{Error, Result, VulkanError};
use crate::exec::{prepare_frame, PrepMode};
use crate::format;
use crate::frame::{Frame, FramesContext, EXPORTABLE_MEMORY_HANDLE_TYPE};
use crate::sync::EXPORTABLE_SEMAPHORE_HANDLE_TYPE;
use crate::utils::AsVkHandle;

/// Identity of one external API consumer.
///
/// Clones refer to the same peer; a frame's export cache is keyed by this
/// identity, so every exporter of a frame must present the same handle.
#[derive(Clone)]
pub struct PeerContext(Arc<PeerInner>);

struct PeerInner {
    name: String,
}

impl PeerContext {
    pub fn new(name: impl Into<String>) -> Self {
        PeerContext(Arc::new(PeerInner { name: name.into() }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl PartialEq for PeerContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PeerContext {}

impl Debug for PeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PeerContext").field(&self.0.name).finish()
    }
}

/// One plane of an exported frame.
///
/// `fd` references the whole backing allocation; the plane's bytes start at
/// `offset` within it. `channels` and `depth` describe the texel layout the
/// peer should give its array: single-component, except the interleaved
/// chroma plane of a two-plane format.
#[derive(Debug)]
pub struct ExportedPlane {
    pub fd: OwnedFd,
    pub size: u64,
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Component width in bits: 8, 16 or 32.
    pub depth: u32,
}

/// One exported timeline semaphore.
#[derive(Debug)]
pub struct ExportedSemaphore {
    pub fd: OwnedFd,
}

/// Everything a peer needs to map a frame.
///
/// `planes` has one entry per plane of the logical format. `semaphores` has
/// one entry per image; planes sharing a combined image share its timeline,
/// so a peer synchronizes each distinct semaphore once, not once per plane.
#[derive(Debug)]
pub struct FrameExportHandles {
    pub planes: Vec<ExportedPlane>,
    pub semaphores: Vec<ExportedSemaphore>,
}

/// Cache slot tying a frame to the one peer it was exported to.
pub(crate) struct FrameExport {
    peer: PeerContext,
    handles: Arc<FrameExportHandles>,
}

/// Timeline window of one external access to one image.
///
/// The peer waits for `wait_value`, does its work, then signals
/// `signal_value`. Windows of consecutive accesses chain: the value one
/// access signals is the value the next one waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handoff {
    pub wait_value: u64,
    pub signal_value: u64,
}

fn handoff_window(sem_value: u64) -> Handoff {
    Handoff {
        wait_value: sem_value,
        signal_value: sem_value + 1,
    }
}

/// Components per texel of one plane: two for the interleaved chroma plane
/// of a two-plane format, one otherwise.
fn plane_channels(planes: usize, plane: usize) -> u32 {
    1 + u32::from(planes == 2 && plane == 1)
}

/// Component width in bits of a per-plane image format.
fn component_depth(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM
        | vk::Format::R8G8_UNORM
        | vk::Format::R8G8B8_UNORM
        | vk::Format::B8G8R8_UNORM
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::B8G8R8A8_UNORM => 8,
        vk::Format::R32_SFLOAT => 32,
        _ => 16,
    }
}

impl FramesContext {
    /// Exports `frame`'s memory and semaphores as opaque fds for `peer`.
    ///
    /// The first call exports and caches; every further call for the same
    /// peer returns the cached handles without touching the driver. A frame
    /// belongs to at most one peer, so presenting a different peer fails.
    /// The handles stay valid independently of the frame: an fd keeps its
    /// allocation alive even after the frame is dropped.
    pub fn export_to(&self, frame: &Frame, peer: &PeerContext) -> Result<Arc<FrameExportHandles>> {
        let mut slot = frame.export_slot().lock().unwrap();
        if let Some(export) = slot.as_ref() {
            if export.peer == *peer {
                return Ok(export.handles.clone());
            }
            return Err(Error::Unsupported(format!(
                "frame is already exported to peer {:?}",
                export.peer.name()
            )));
        }

        if !self
            .alloc_export_types()
            .contains(EXPORTABLE_MEMORY_HANDLE_TYPE)
        {
            return Err(Error::Unsupported(
                "frame memory was not allocated exportable".into(),
            ));
        }
        if !self.semaphore_exportable() {
            return Err(Error::MissingRequiredFeature("VK_KHR_external_semaphore_fd"));
        }
        let memory_fns = self
            .device()
            .memory_fd_fns()
            .ok_or(Error::MissingRequiredFeature("VK_KHR_external_memory_fd"))?;
        let semaphore_fns = self
            .device()
            .semaphore_fd_fns()
            .ok_or(Error::MissingRequiredFeature("VK_KHR_external_semaphore_fd"))?;

        let pixfmt = frame.pixel_format();
        let entry = format::lookup(pixfmt)
            .ok_or_else(|| Error::Unsupported(format!("unknown pixel format {pixfmt:?}")))?;
        let planes = pixfmt.plane_count() as usize;
        let image_count = frame.image_count();

        let mut exported = Vec::with_capacity(planes);
        for plane in 0..planes {
            let image = plane.min(image_count - 1);
            let info = vk::MemoryGetFdInfoKHR::default()
                .memory(frame.memory().handle(image))
                .handle_type(EXPORTABLE_MEMORY_HANDLE_TYPE);
            // Safety: the memory was allocated exportable as this handle
            // type, checked above.
            let fd = unsafe { memory_fns.get_memory_fd(&info) }.map_err(|ret| {
                tracing::error!(result = ?ret, plane, "failed to export frame memory");
                VulkanError(ret)
            })?;
            // Safety: a successful export hands a fresh fd to the caller.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let extent = pixfmt.plane_extent(frame.width(), frame.height(), plane);
            exported.push(ExportedPlane {
                fd,
                size: frame.memory().object_size(image),
                offset: frame.memory().offset(image),
                width: extent.width,
                height: extent.height,
                channels: plane_channels(planes, plane),
                depth: component_depth(entry.fallback[plane.min(entry.fallback.len() - 1)]),
            });
        }

        let mut semaphores = Vec::with_capacity(image_count);
        for image in 0..image_count {
            let info = vk::SemaphoreGetFdInfoKHR::default()
                .semaphore(frame.semaphore(image).vk_handle())
                .handle_type(EXPORTABLE_SEMAPHORE_HANDLE_TYPE);
            // Safety: the semaphore was created exportable, checked above.
            let fd = unsafe { semaphore_fns.get_semaphore_fd(&info) }.map_err(|ret| {
                tracing::error!(result = ?ret, image, "failed to export frame semaphore");
                VulkanError(ret)
            })?;
            semaphores.push(ExportedSemaphore {
                // Safety: as for the memory fd above.
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            });
        }

        let handles = Arc::new(FrameExportHandles {
            planes: exported,
            semaphores,
        });
        *slot = Some(FrameExport {
            peer: peer.clone(),
            handles: handles.clone(),
        });
        tracing::debug!(peer = peer.name(), planes, "exported frame");
        Ok(handles)
    }

    /// Releases `frame` to its peer and returns the timeline window of this
    /// access, one [`Handoff`] per image in the order of
    /// [`FrameExportHandles::semaphores`].
    ///
    /// The release barrier is submitted but not waited; the peer's first
    /// wait covers it. Until [`Self::end_external_access`] the frame must
    /// not be touched through this crate.
    pub fn begin_external_access(&self, frame: &Frame) -> Result<Vec<Handoff>> {
        prepare_frame(self.compute_pool(), frame, PrepMode::ExternalExport)?;
        let states = frame.states();
        Ok(states.iter().map(|s| handoff_window(s.sem_value)).collect())
    }

    /// Reclaims `frame` after the peer signaled its handoff values.
    ///
    /// Folds the peer's signals into the tracked timelines, then submits the
    /// acquire barrier, which waits for those signals on the device.
    pub fn end_external_access(&self, frame: &Frame) -> Result<()> {
        {
            let mut states = frame.states();
            for state in states.iter_mut() {
                state.sem_value += 1;
            }
        }
        prepare_frame(self.compute_pool(), frame, PrepMode::ExternalImport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_compare_by_identity() {
        let peer = PeerContext::new("cuda");
        let clone = peer.clone();
        let other = PeerContext::new("cuda");
        assert_eq!(peer, clone);
        assert_ne!(peer, other);
    }

    #[test]
    fn handoff_windows_chain() {
        let first = handoff_window(0);
        assert_eq!(first.wait_value, 0);
        assert_eq!(first.signal_value, 1);
        // The frame records the signal; the next access waits for it.
        let second = handoff_window(first.signal_value);
        assert_eq!(second.wait_value, first.signal_value);
    }

    #[test]
    fn only_two_plane_chroma_gets_two_channels() {
        assert_eq!(plane_channels(2, 0), 1);
        assert_eq!(plane_channels(2, 1), 2);
        assert_eq!(plane_channels(3, 1), 1);
        assert_eq!(plane_channels(1, 0), 1);
    }

    #[test]
    fn component_depth_by_format_width() {
        assert_eq!(component_depth(vk::Format::R8_UNORM), 8);
        assert_eq!(component_depth(vk::Format::R8G8_UNORM), 8);
        assert_eq!(component_depth(vk::Format::R16_UNORM), 16);
        assert_eq!(component_depth(vk::Format::R16G16B16A16_UNORM), 16);
        assert_eq!(component_depth(vk::Format::R32_SFLOAT), 32);
    }
}
