use std::os::fd::{AsRawFd, OwnedFd};

use super::{DmabufDescription, DmabufPlane, FrameIdentity};
use crate::error::ImportError;
use crate::format::{FormatCatalog, FourCc};

/// One buffer object of an `AVDRMFrameDescriptor`. The decoder owns the fd.
#[derive(Debug)]
pub struct DrmObject {
    pub fd: OwnedFd,
    pub size: usize,
    pub format_modifier: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DrmPlane {
    pub object_index: usize,
    pub offset: u32,
    pub pitch: u32,
}

#[derive(Debug, Clone)]
pub struct DrmLayer {
    pub format: u32,
    pub planes: Vec<DrmPlane>,
}

#[derive(Debug)]
pub struct DrmFrameDescriptor {
    pub objects: Vec<DrmObject>,
    pub layers: Vec<DrmLayer>,
}

impl DrmFrameDescriptor {
    pub(super) fn identity(&self) -> Result<FrameIdentity, ImportError> {
        let object = self.objects.first().ok_or(ImportError::MissingObject(0))?;
        Ok(FrameIdentity(object.fd.as_raw_fd() as u64))
    }
}

#[derive(Debug, Default)]
pub struct DrmPrimeImporter;

impl DrmPrimeImporter {
    /// Duplicates every object the layers reference. The decoder keeps its own
    /// descriptors; the duplicates live as long as the returned description.
    /// Planes are numbered across layers and the last layer's format wins.
    /// Formats the catalog rejects fail before any descriptor is duplicated.
    pub fn import(
        &self,
        desc: &DrmFrameDescriptor,
        width: u32,
        height: u32,
        catalog: &FormatCatalog,
    ) -> Result<DmabufDescription, ImportError> {
        let mut format = None;
        let mut planes = Vec::new();
        for layer in &desc.layers {
            format = Some(layer.format);
            for plane in &layer.planes {
                let object = desc
                    .objects
                    .get(plane.object_index)
                    .ok_or(ImportError::MissingObject(plane.object_index))?;
                planes.push(DmabufPlane {
                    object: plane.object_index,
                    offset: plane.offset,
                    stride: plane.pitch,
                    modifier: object.format_modifier,
                });
            }
        }

        let format = format.ok_or(ImportError::NoPlanes)?;
        let modifier = planes.first().ok_or(ImportError::NoPlanes)?.modifier;
        if !catalog.supports(format, modifier) {
            return Err(ImportError::Unsupported {
                format: FourCc(format),
                modifier,
            });
        }

        let mut objects = Vec::with_capacity(desc.objects.len());
        for object in &desc.objects {
            objects.push(object.fd.try_clone().map_err(ImportError::Dup)?);
        }
        Ok(DmabufDescription {
            format,
            width,
            height,
            objects,
            planes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwdec::test_util::{memfd, open_fd_count};
    use serial_test::serial;

    const NV12: FourCc = FourCc::from_chars(b"NV12");

    fn catalog() -> FormatCatalog {
        let mut catalog = FormatCatalog::new();
        catalog.record(NV12.0, 0);
        catalog
    }

    fn descriptor(plane_object: usize) -> DrmFrameDescriptor {
        DrmFrameDescriptor {
            objects: vec![DrmObject {
                fd: memfd("drm-object"),
                size: 64,
                format_modifier: 0,
            }],
            layers: vec![DrmLayer {
                format: NV12.0,
                planes: vec![DrmPlane {
                    object_index: plane_object,
                    offset: 0,
                    pitch: 64,
                }],
            }],
        }
    }

    #[test]
    #[serial]
    fn identity_is_the_first_object_fd() {
        let desc = descriptor(0);
        let raw = desc.objects[0].fd.as_raw_fd();
        assert_eq!(desc.identity().unwrap(), FrameIdentity(raw as u64));
    }

    #[test]
    #[serial]
    fn broken_layout_opens_no_descriptor() {
        let desc = descriptor(3);
        let before = open_fd_count();
        assert!(matches!(
            DrmPrimeImporter.import(&desc, 64, 32, &catalog()),
            Err(ImportError::MissingObject(3))
        ));
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    #[serial]
    fn unsupported_format_is_rejected_before_duplicating() {
        let desc = descriptor(0);
        let mut catalog = FormatCatalog::new();
        catalog.record(FourCc::from_chars(b"P010").0, 0);

        let before = open_fd_count();
        let result = DrmPrimeImporter.import(&desc, 64, 32, &catalog);
        assert_eq!(open_fd_count(), before);
        match result {
            Err(ImportError::Unsupported { format, modifier }) => {
                assert_eq!(format, NV12);
                assert_eq!(modifier, 0);
            }
            other => panic!("expected an unsupported format error, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn import_duplicates_decoder_descriptors() {
        let desc = descriptor(0);
        let before = open_fd_count();
        let imported = DrmPrimeImporter.import(&desc, 64, 32, &catalog()).unwrap();
        assert_eq!(open_fd_count(), before + 1);
        assert_ne!(imported.objects[0].as_raw_fd(), desc.objects[0].fd.as_raw_fd());
        drop(imported);
        assert_eq!(open_fd_count(), before);
    }
}
