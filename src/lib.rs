//! Zero-copy video output for Wayland compositors.
//!
//! Hardware-decoded frames (VA-API surfaces or DRM PRIME descriptors) are
//! imported as `zwp_linux_dmabuf_v1` buffers and shown on a video subsurface,
//! paced by frame callbacks and presentation feedback. [`OutputSession`] is
//! the entry point.

pub mod buffer;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod format;
pub mod hwdec;
pub mod present;
pub mod session;
pub mod window;

pub use config::Config;
pub use error::{ImportError, PoolError, SessionError};
pub use format::{FormatCatalog, FormatEntry, FourCc};
pub use hwdec::{FramePayload, HwdecBackend, VideoFrame};
pub use present::VsyncInfo;
pub use session::{OutputSession, OutputSummary};
pub use window::VoEvents;
