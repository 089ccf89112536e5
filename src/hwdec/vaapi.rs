use std::os::fd::OwnedFd;
use std::sync::Arc;

use tracing::debug;

use super::{DmabufDescription, DmabufPlane};
use crate::error::ImportError;
use crate::format::FourCc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaSurfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaStatus(pub i32);

impl VaStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const ERROR_OPERATION_FAILED: Self = Self(0x0000_0001);
    pub const ERROR_INVALID_SURFACE: Self = Self(0x0000_0006);
}

#[derive(Debug)]
pub struct VaObject {
    pub fd: OwnedFd,
    pub size: u32,
    pub drm_format_modifier: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct VaPlane {
    pub object_index: usize,
    pub offset: u32,
    pub pitch: u32,
}

#[derive(Debug, Clone)]
pub struct VaLayer {
    pub drm_format: u32,
    pub planes: Vec<VaPlane>,
}

/// `VADRMPRIMESurfaceDescriptor` with the exported object descriptors owned.
#[derive(Debug)]
pub struct VaDrmPrimeDescriptor {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
    pub objects: Vec<VaObject>,
    pub layers: Vec<VaLayer>,
}

/// A VA display able to export surfaces as DRM PRIME 2 descriptors.
///
/// Implementations call `vaExportSurfaceHandle` with composed layers and
/// read-only access. On success the returned descriptors belong to the caller.
pub trait VaSurfaceExporter {
    fn export_surface(&self, surface: VaSurfaceId) -> Result<VaDrmPrimeDescriptor, VaStatus>;
}

pub struct VaapiImporter {
    display: Arc<dyn VaSurfaceExporter>,
}

impl VaapiImporter {
    pub fn new(display: Arc<dyn VaSurfaceExporter>) -> Self {
        Self { display }
    }

    /// Composed export yields a single layer; only its planes are imported.
    pub fn import(
        &self,
        surface: VaSurfaceId,
        width: u32,
        height: u32,
    ) -> Result<DmabufDescription, ImportError> {
        let desc = self
            .display
            .export_surface(surface)
            .map_err(|status| match status {
                VaStatus::ERROR_INVALID_SURFACE => {
                    debug!(surface = surface.0, "VA export to composed layers not supported");
                    ImportError::ComposedLayersUnsupported
                }
                VaStatus(code) => ImportError::Export(code),
            })?;

        let layer = desc.layers.first().ok_or(ImportError::NoPlanes)?;
        let planes = layer
            .planes
            .iter()
            .map(|plane| {
                let object = desc
                    .objects
                    .get(plane.object_index)
                    .ok_or(ImportError::MissingObject(plane.object_index))?;
                Ok(DmabufPlane {
                    object: plane.object_index,
                    offset: plane.offset,
                    stride: plane.pitch,
                    modifier: object.drm_format_modifier,
                })
            })
            .collect::<Result<Vec<_>, ImportError>>()?;
        if planes.is_empty() {
            return Err(ImportError::NoPlanes);
        }

        let format = layer.drm_format;
        tracing::trace!(
            surface = surface.0,
            format = %FourCc(format),
            planes = planes.len(),
            "exported VA surface"
        );
        Ok(DmabufDescription {
            format,
            width: if desc.width > 0 { desc.width } else { width },
            height: if desc.height > 0 { desc.height } else { height },
            objects: desc.objects.into_iter().map(|object| object.fd).collect(),
            planes,
        })
    }
}
