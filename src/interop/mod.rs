//! Zero-copy sharing of frames with other APIs.
//!
//! Two bridges live here. [`FramesContext::export_to`] hands a frame's
//! memory and timelines to a compute API as opaque fds, with the
//! [`FramesContext::begin_external_access`]/[`FramesContext::end_external_access`]
//! pair fencing each round of external work. [`FramesContext::import_drm`]
//! and [`FramesContext::export_drm`] move whole frames across process and
//! API boundaries as DRM PRIME dma-buf descriptors.
//!
//! [`FramesContext::export_to`]: crate::frame::FramesContext::export_to
//! [`FramesContext::begin_external_access`]: crate::frame::FramesContext::begin_external_access
//! [`FramesContext::end_external_access`]: crate::frame::FramesContext::end_external_access
//! [`FramesContext::import_drm`]: crate::frame::FramesContext::import_drm
//! [`FramesContext::export_drm`]: crate::frame::FramesContext::export_drm

mod drm;
mod external;

pub use drm::{DrmDescriptor, DrmExport, DrmExportObject, DrmLayer, DrmObject, DrmPlane};
pub use external::{ExportedPlane, ExportedSemaphore, FrameExportHandles, Handoff, PeerContext};

pub(crate) use external::FrameExport;
