//! Hardware decoder frame import.
//!
//! A decoded frame arrives either as a VA-API surface or as a DRM PRIME frame
//! descriptor. Both are turned into a [`DmabufDescription`]: a set of owned
//! dmabuf descriptors plus the plane layout the compositor needs to build a
//! `wl_buffer`. Descriptors are owned by the description and closed when it
//! is dropped, whether or not the import went through.

mod drmprime;
mod vaapi;

use std::os::fd::OwnedFd;
use std::sync::Arc;

pub use drmprime::{DrmFrameDescriptor, DrmLayer, DrmObject, DrmPlane, DrmPrimeImporter};
pub use vaapi::{
    VaDrmPrimeDescriptor, VaLayer, VaObject, VaPlane, VaStatus, VaSurfaceExporter, VaSurfaceId,
    VaapiImporter,
};

use crate::error::ImportError;
use crate::format::FormatCatalog;

/// Opaque per-frame key. For VA-API it is the surface id, for DRM PRIME the
/// raw descriptor number of the first object. Only compared, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIdentity(pub u64);

#[derive(Debug, Clone)]
pub enum FramePayload {
    Vaapi(VaSurfaceId),
    DrmPrime(Arc<DrmFrameDescriptor>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Vaapi,
    DrmPrime,
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub payload: FramePayload,
}

impl VideoFrame {
    pub fn image_format(&self) -> ImageFormat {
        match self.payload {
            FramePayload::Vaapi(_) => ImageFormat::Vaapi,
            FramePayload::DrmPrime(_) => ImageFormat::DrmPrime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufPlane {
    /// Index into [`DmabufDescription::objects`].
    pub object: usize,
    pub offset: u32,
    pub stride: u32,
    pub modifier: u64,
}

#[derive(Debug)]
pub struct DmabufDescription {
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub objects: Vec<OwnedFd>,
    pub planes: Vec<DmabufPlane>,
}

impl DmabufDescription {
    /// Modifier of the first plane, the one checked against the format catalog.
    pub fn modifier(&self) -> Option<u64> {
        self.planes.first().map(|plane| plane.modifier)
    }
}

/// The decoder interop in use, chosen once per session.
pub enum HwdecBackend {
    Vaapi(VaapiImporter),
    DrmPrime(DrmPrimeImporter),
}

impl HwdecBackend {
    /// VA-API when a VA display is available, DRM PRIME otherwise.
    pub fn probe(va_display: Option<Arc<dyn VaSurfaceExporter>>) -> Self {
        match va_display {
            Some(display) => {
                tracing::debug!("using VA-API dmabuf importer");
                Self::Vaapi(VaapiImporter::new(display))
            }
            None => {
                tracing::debug!("no VA display, using DRM PRIME dmabuf importer");
                Self::DrmPrime(DrmPrimeImporter)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Vaapi(_) => "vaapi",
            Self::DrmPrime(_) => "drmprime",
        }
    }

    pub fn identity(&self, frame: &VideoFrame) -> Result<FrameIdentity, ImportError> {
        match (self, &frame.payload) {
            (Self::Vaapi(_), FramePayload::Vaapi(surface)) => Ok(FrameIdentity(surface.0 as u64)),
            (Self::DrmPrime(_), FramePayload::DrmPrime(desc)) => desc.identity(),
            _ => Err(ImportError::ForeignFrame(self.name())),
        }
    }

    /// DRM PRIME frames carry their format up front and are checked against
    /// the catalog before import. VA-API surfaces only reveal it on export.
    pub fn import(
        &self,
        frame: &VideoFrame,
        catalog: &FormatCatalog,
    ) -> Result<DmabufDescription, ImportError> {
        match (self, &frame.payload) {
            (Self::Vaapi(importer), FramePayload::Vaapi(surface)) => {
                importer.import(*surface, frame.width, frame.height)
            }
            (Self::DrmPrime(importer), FramePayload::DrmPrime(desc)) => {
                importer.import(desc, frame.width, frame.height, catalog)
            }
            _ => Err(ImportError::ForeignFrame(self.name())),
        }
    }
}

impl std::fmt::Debug for HwdecBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HwdecBackend").field(&self.name()).finish()
    }
}

/// Only hardware frames can be shown.
pub fn query_format(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Vaapi | ImageFormat::DrmPrime)
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::io::Write;
    use std::os::fd::OwnedFd;

    pub fn memfd(name: &str) -> OwnedFd {
        let memfd = memfd::MemfdOptions::default().create(name).unwrap();
        memfd.as_file().write_all(&[0u8; 64]).unwrap();
        OwnedFd::from(memfd.into_file())
    }

    pub fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_prefers_vaapi_when_a_display_exists() {
        struct NoExport;
        impl VaSurfaceExporter for NoExport {
            fn export_surface(&self, _: VaSurfaceId) -> Result<VaDrmPrimeDescriptor, VaStatus> {
                Err(VaStatus::ERROR_INVALID_SURFACE)
            }
        }

        assert_eq!(HwdecBackend::probe(Some(Arc::new(NoExport))).name(), "vaapi");
        assert_eq!(HwdecBackend::probe(None).name(), "drmprime");
    }

    #[test]
    fn frames_of_the_other_backend_are_rejected() {
        let backend = HwdecBackend::probe(None);
        let frame = VideoFrame {
            width: 16,
            height: 16,
            payload: FramePayload::Vaapi(VaSurfaceId(3)),
        };
        assert!(matches!(
            backend.identity(&frame),
            Err(ImportError::ForeignFrame("drmprime"))
        ));
        assert!(query_format(frame.image_format()));
    }
}
