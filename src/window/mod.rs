//! Window geometry and xdg-shell state negotiation.
//!
//! [`WindowState`] never talks to the compositor itself. Local changes queue
//! [`ShellRequest`]s that the session sends, and compositor configure events
//! are fed back in once acknowledged. What the compositor reports always wins.

mod edges;
mod geometry;
mod state;

pub use edges::{check_for_resize, ResizeEdge};
pub use geometry::{gcd, letterbox, reduce_aspect, Rect};
pub use state::{
    DecorationMode, Negotiated, Phase, ShellRequest, ToplevelStates, VoEvents, WindowOptions,
    WindowState,
};
