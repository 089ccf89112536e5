use std::os::fd::AsFd;

use wayland_client::{protocol::wl_buffer::WlBuffer, Dispatch, QueueHandle};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1::{self, ZwpLinuxBufferParamsV1},
    zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
};

use super::DmabufAllocator;
use crate::error::ImportError;
use crate::hwdec::DmabufDescription;

/// Creates `wl_buffer`s through `zwp_linux_buffer_params_v1.create_immed`.
pub struct WaylandDmabufAllocator<D> {
    dmabuf: Option<ZwpLinuxDmabufV1>,
    qh: QueueHandle<D>,
}

impl<D> WaylandDmabufAllocator<D>
where
    D: Dispatch<ZwpLinuxBufferParamsV1, ()> + Dispatch<WlBuffer, ()> + 'static,
{
    pub fn new(dmabuf: Option<ZwpLinuxDmabufV1>, qh: QueueHandle<D>) -> Self {
        Self { dmabuf, qh }
    }
}

impl<D> DmabufAllocator for WaylandDmabufAllocator<D>
where
    D: Dispatch<ZwpLinuxBufferParamsV1, ()> + Dispatch<WlBuffer, ()> + 'static,
{
    type Buffer = WlBuffer;

    fn create_buffer(&mut self, desc: &DmabufDescription) -> Result<WlBuffer, ImportError> {
        let dmabuf = self.dmabuf.as_ref().ok_or_else(|| {
            ImportError::BufferCreation("zwp_linux_dmabuf_v1 is not available".into())
        })?;
        let width = i32::try_from(desc.width)
            .map_err(|_| ImportError::BufferCreation(format!("width {} too large", desc.width)))?;
        let height = i32::try_from(desc.height).map_err(|_| {
            ImportError::BufferCreation(format!("height {} too large", desc.height))
        })?;

        let params = dmabuf.create_params(&self.qh, ());
        for (plane_idx, plane) in desc.planes.iter().enumerate() {
            let Some(fd) = desc.objects.get(plane.object) else {
                params.destroy();
                return Err(ImportError::MissingObject(plane.object));
            };
            params.add(
                fd.as_fd(),
                plane_idx as u32,
                plane.offset,
                plane.stride,
                (plane.modifier >> 32) as u32,
                (plane.modifier & 0xffff_ffff) as u32,
            );
        }
        let buffer = params.create_immed(
            width,
            height,
            desc.format,
            zwp_linux_buffer_params_v1::Flags::empty(),
            &self.qh,
            (),
        );
        params.destroy();
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: WlBuffer) {
        buffer.destroy();
    }
}
