use std::io;
use std::os::fd::AsFd;

use memfd::{FileSeal, MemfdOptions};
use wayland_client::{
    protocol::{
        wl_buffer::WlBuffer,
        wl_shm::{self, WlShm},
        wl_shm_pool::WlShmPool,
    },
    Dispatch, QueueHandle,
};

const WIDTH: i32 = 1;
const HEIGHT: i32 = 1;
const STRIDE: i32 = (WIDTH * 4 + 15) & !15;

/// A 1x1 black XRGB8888 buffer, stretched over the main surface by its viewport.
#[derive(Debug)]
pub struct SolidBuffer {
    pool: WlShmPool,
    buffer: WlBuffer,
}

impl SolidBuffer {
    pub fn new<D>(shm: &WlShm, qh: &QueueHandle<D>) -> io::Result<Self>
    where
        D: Dispatch<WlShmPool, ()> + Dispatch<WlBuffer, ()> + 'static,
    {
        let size = STRIDE * HEIGHT;
        let memfd = MemfdOptions::default()
            .close_on_exec(true)
            .allow_sealing(true)
            .create("dmabuf-wayland-solid")
            .map_err(io::Error::other)?;
        memfd.as_file().set_len(size as u64)?;
        memfd
            .add_seal(FileSeal::SealShrink)
            .and_then(|_| memfd.add_seal(FileSeal::SealGrow))
            .and_then(|_| memfd.add_seal(FileSeal::SealSeal))
            .map_err(io::Error::other)?;

        let pool = shm.create_pool(memfd.as_file().as_fd(), size, qh, ());
        let buffer = pool.create_buffer(0, WIDTH, HEIGHT, STRIDE, wl_shm::Format::Xrgb8888, qh, ());
        Ok(Self { pool, buffer })
    }

    pub fn wl_buffer(&self) -> &WlBuffer {
        &self.buffer
    }
}

impl Drop for SolidBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
        self.pool.destroy();
    }
}
