use thiserror::Error;
use wayland_client::{
    globals::{BindError, GlobalError},
    ConnectError, DispatchError,
};

use crate::format::FourCc;

/// Fatal errors: raised while setting up or tearing down the output session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to the wayland display: {0}")]
    Connect(#[from] ConnectError),
    #[error("failed to retrieve the global list: {0}")]
    Globals(#[from] GlobalError),
    #[error("compositor doesn't support the required {interface} protocol: {source}")]
    MissingProtocol {
        interface: &'static str,
        #[source]
        source: BindError,
    },
    #[error("no outputs found or compositor doesn't support wl_output (ver. 2)")]
    NoOutputs,
    #[error("failed to dispatch wayland events: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("wayland connection error: {0}")]
    Wayland(#[from] wayland_backend::client::WaylandError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-frame import failures. These never abort the session: the frame is
/// skipped and the caller may retry with the next one.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no hardware decode backend is bound to the buffer pool")]
    NoBackend,
    #[error("frame payload does not belong to the {0} backend")]
    ForeignFrame(&'static str),
    #[error("{format}({modifier:#018x}) is not supported by the compositor")]
    Unsupported { format: FourCc, modifier: u64 },
    #[error("VA export to composed layers not supported")]
    ComposedLayersUnsupported,
    #[error("vaExportSurfaceHandle() failed with status {0}")]
    Export(i32),
    #[error("frame descriptor has no planes")]
    NoPlanes,
    #[error("plane references missing object {0}")]
    MissingObject(usize),
    #[error("failed to duplicate plane descriptor: {0}")]
    Dup(#[source] std::io::Error),
    #[error("failed to create compositor buffer: {0}")]
    BufferCreation(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("buffer pool is already bound to the {0} backend and still holds entries")]
    AlreadyBound(&'static str),
}
