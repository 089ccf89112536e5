use smithay_client_toolkit::output::OutputInfo;
use tracing::{error, warn};

use crate::window::Rect;

/// What the session needs to know about a `wl_output`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSummary {
    pub name: Option<String>,
    pub make: String,
    pub model: String,
    /// Position and current mode size, in pixels.
    pub geometry: Rect,
    pub scale: i32,
    pub refresh_hz: f64,
    pub has_surface: bool,
}

impl OutputSummary {
    pub fn from_info(info: &OutputInfo, has_surface: bool) -> Self {
        let mode = info.modes.iter().find(|mode| mode.current);
        let (width, height) = mode.map(|mode| mode.dimensions).unwrap_or((0, 0));
        let (x, y) = info.location;
        Self {
            name: info.name.clone(),
            make: info.make.clone(),
            model: info.model.clone(),
            geometry: Rect {
                x0: x,
                y0: y,
                x1: x + width,
                y1: y + height,
            },
            scale: info.scale_factor,
            refresh_hz: mode
                .map(|mode| mode.refresh_rate as f64 / 1000.0)
                .unwrap_or(0.0),
            has_surface,
        }
    }

    /// Connector name when the compositor sent one, the model otherwise.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.model)
    }

    fn matches_name(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name) || self.model == name
    }
}

/// Picks the output index for fullscreen placement.
///
/// A name is matched against the connector name and the model. With no
/// match, or nothing asked for, the first output is used.
pub fn find_output(
    outputs: &[OutputSummary],
    screen_id: Option<usize>,
    screen_name: Option<&str>,
) -> Option<usize> {
    if outputs.is_empty() {
        error!("No screens could be found!");
        return None;
    }

    if let Some(name) = screen_name {
        if let Some(index) = outputs.iter().position(|output| output.matches_name(name)) {
            return Some(index);
        }
        warn!("Screen name {name} not found, falling back to the first output");
        return Some(0);
    }

    if let Some(id) = screen_id {
        if id < outputs.len() {
            return Some(id);
        }
        warn!(
            "Screen index {id} not found, {} screen(s) available, falling back to the first output",
            outputs.len()
        );
    }
    Some(0)
}
