mod dmabuf;
mod pool;
mod solid;

pub use dmabuf::WaylandDmabufAllocator;
pub use pool::{BufferPool, PoolEntry, ResetWindow};
pub use solid::SolidBuffer;

use crate::error::ImportError;
use crate::hwdec::DmabufDescription;

/// Turns an imported dmabuf description into a compositor buffer.
///
/// The description keeps ownership of its descriptors, so they are closed
/// after `create_buffer` returns regardless of the outcome.
pub trait DmabufAllocator {
    type Buffer;

    fn create_buffer(&mut self, desc: &DmabufDescription) -> Result<Self::Buffer, ImportError>;
    fn destroy_buffer(&mut self, buffer: Self::Buffer);
}
