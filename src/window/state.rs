use bitflags::bitflags;
use tracing::{debug, trace, warn};

use super::edges::{check_for_resize, ResizeEdge};
use super::geometry::{reduce_aspect, Rect};
use crate::config::Config;

bitflags! {
    /// Events the video driver has to react to, collected between checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VoEvents: u32 {
        const RESIZE = 1 << 0;
        const EXPOSE = 1 << 1;
        const FOCUS = 1 << 2;
        const WIN_STATE = 1 << 3;
        const DPI = 1 << 4;
    }
}

bitflags! {
    /// `xdg_toplevel` states carried by a configure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ToplevelStates: u32 {
        const MAXIMIZED = 1 << 0;
        const FULLSCREEN = 1 << 1;
        const RESIZING = 1 << 2;
        const ACTIVATED = 1 << 3;
        const TILED_LEFT = 1 << 4;
        const TILED_RIGHT = 1 << 5;
        const TILED_TOP = 1 << 6;
        const TILED_BOTTOM = 1 << 7;
        const SUSPENDED = 1 << 8;
    }
}

impl ToplevelStates {
    /// Tiling counts as maximized: the compositor dictates the size either way.
    pub fn is_maximized(&self) -> bool {
        self.intersects(
            Self::MAXIMIZED
                | Self::TILED_LEFT
                | Self::TILED_RIGHT
                | Self::TILED_TOP
                | Self::TILED_BOTTOM,
        )
    }

    pub fn is_fullscreen(&self) -> bool {
        self.contains(Self::FULLSCREEN)
    }
}

/// A value the client asks for and the compositor decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated<T> {
    pub requested: Option<T>,
    pub confirmed: T,
}

impl<T: Copy + PartialEq> Negotiated<T> {
    pub fn new(confirmed: T) -> Self {
        Self {
            requested: None,
            confirmed,
        }
    }

    pub fn request(&mut self, value: T) {
        self.requested = Some(value);
    }

    /// Records the compositor's answer. Returns whether the confirmed value changed.
    pub fn confirm(&mut self, value: T) -> bool {
        self.requested = None;
        let changed = self.confirmed != value;
        self.confirmed = value;
        changed
    }

    pub fn in_flight(&self) -> Option<T> {
        self.requested
    }

    pub fn get(&self) -> T {
        self.confirmed
    }

    /// The requested value while a request is in flight, else the confirmed one.
    pub fn desired(&self) -> T {
        self.requested.unwrap_or(self.confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecorationMode {
    ClientSide,
    ServerSide,
}

impl DecorationMode {
    fn from_border(border: bool) -> Self {
        if border {
            Self::ServerSide
        } else {
            Self::ClientSide
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientSide => "client-side",
            Self::ServerSide => "server-side",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unconfigured,
    Configuring,
    Steady,
}

/// Requests for the session to forward to the compositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellRequest {
    SetFullscreen,
    UnsetFullscreen,
    SetMaximized,
    UnsetMaximized,
    SetMinimized,
    SetDecorationMode(DecorationMode),
    SetTitle(String),
    SetAppId(String),
    Move,
    Resize(ResizeEdge),
}

#[derive(Debug, Clone)]
pub struct WindowOptions {
    pub fullscreen: bool,
    pub maximized: bool,
    pub minimized: bool,
    pub border: bool,
    pub keepaspect: bool,
    pub keepaspect_window: bool,
    pub hidpi_window_scale: bool,
    pub configure_bounds: bool,
    pub edge_pixels_pointer: i32,
    pub edge_pixels_touch: i32,
    /// Explicit window size in pixels, 0 to follow the video.
    pub width: i32,
    pub height: i32,
}

impl WindowOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fullscreen: config.window.fullscreen,
            maximized: config.window.maximized,
            minimized: config.window.minimized,
            border: config.window.border,
            keepaspect: config.window.keepaspect,
            keepaspect_window: config.window.keepaspect_window,
            hidpi_window_scale: config.window.hidpi_window_scale,
            configure_bounds: config.wayland.configure_bounds,
            edge_pixels_pointer: config.wayland.edge_pixels_pointer,
            edge_pixels_touch: config.wayland.edge_pixels_touch,
            width: config.window.width,
            height: config.window.height,
        }
    }
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct ToplevelConfigure {
    width: i32,
    height: i32,
    states: ToplevelStates,
}

/// All sizes are in surface-local (logical) units unless stated otherwise.
#[derive(Debug)]
pub struct WindowState {
    opts: WindowOptions,
    phase: Phase,

    /// Current content rectangle.
    geometry: Rect,
    /// Size to return to when leaving fullscreen or maximized.
    window_size: Rect,
    /// Size the video asks for.
    vdparams: Rect,
    reduced: (i32, i32),
    scaling: i32,
    video_size: (i32, i32),
    has_output: bool,

    fullscreen: Negotiated<bool>,
    maximized: Negotiated<bool>,
    minimized: bool,
    decoration: Negotiated<DecorationMode>,
    has_decoration_manager: bool,

    toplevel_size: (i32, i32),
    bounds: (i32, i32),
    pending_configure: Option<ToplevelConfigure>,
    state_change: bool,

    activated: bool,
    has_keyboard_input: bool,
    focused: bool,

    events: VoEvents,
    requests: Vec<ShellRequest>,
}

impl WindowState {
    pub fn new(opts: WindowOptions) -> Self {
        let mut fullscreen = Negotiated::new(false);
        if opts.fullscreen {
            fullscreen.request(true);
        }
        let mut maximized = Negotiated::new(false);
        if opts.maximized {
            maximized.request(true);
        }
        Self {
            minimized: opts.minimized,
            decoration: Negotiated::new(DecorationMode::ClientSide),
            opts,
            phase: Phase::Unconfigured,
            geometry: Rect::default(),
            window_size: Rect::default(),
            vdparams: Rect::default(),
            reduced: (1, 1),
            scaling: 1,
            video_size: (0, 0),
            has_output: false,
            fullscreen,
            maximized,
            has_decoration_manager: false,
            toplevel_size: (0, 0),
            bounds: (0, 0),
            pending_configure: None,
            state_change: false,
            activated: false,
            has_keyboard_input: false,
            focused: false,
            events: VoEvents::empty(),
            requests: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn geometry(&self) -> Rect {
        self.geometry
    }

    pub fn window_size(&self) -> Rect {
        self.window_size
    }

    pub fn vdparams(&self) -> Rect {
        self.vdparams
    }

    pub fn scaling(&self) -> i32 {
        self.scaling
    }

    pub fn video_size(&self) -> (i32, i32) {
        self.video_size
    }

    pub fn keepaspect(&self) -> bool {
        self.opts.keepaspect
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen.get()
    }

    pub fn is_maximized(&self) -> bool {
        self.maximized.get()
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn fullscreen(&self) -> Negotiated<bool> {
        self.fullscreen
    }

    pub fn maximized(&self) -> Negotiated<bool> {
        self.maximized
    }

    pub fn decoration(&self) -> Negotiated<DecorationMode> {
        self.decoration
    }

    pub fn border(&self) -> bool {
        self.decoration.get() == DecorationMode::ServerSide
    }

    pub fn focused(&self) -> bool {
        self.focused
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn take_requests(&mut self) -> Vec<ShellRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn pending_events(&self) -> VoEvents {
        self.events
    }

    /// Drains pending events. A resize always implies an expose.
    pub fn take_events(&mut self) -> VoEvents {
        let mut events = std::mem::take(&mut self.events);
        if events.contains(VoEvents::RESIZE) {
            events |= VoEvents::EXPOSE;
        }
        events
    }

    pub fn add_events(&mut self, events: VoEvents) {
        self.events |= events;
    }

    fn push_request(&mut self, request: ShellRequest) {
        trace!(?request, "queued shell request");
        self.requests.push(request);
        self.mark_speculative();
    }

    /// Local changes made in steady state wait for the next configure.
    fn mark_speculative(&mut self) {
        if self.phase == Phase::Steady {
            self.phase = Phase::Configuring;
        }
    }

    /// Decoration negotiation is only possible with a decoration manager.
    pub fn init_decorations(&mut self, available: bool) {
        self.has_decoration_manager = available;
        if available {
            let mode = DecorationMode::from_border(self.opts.border);
            self.decoration.request(mode);
            self.push_request(ShellRequest::SetDecorationMode(mode));
        } else {
            self.decoration.confirm(DecorationMode::ClientSide);
            debug!("no decoration manager, border forced off");
        }
    }

    fn target_scaling(&self, output_scale: i32) -> i32 {
        if self.opts.hidpi_window_scale {
            output_scale.max(1)
        } else {
            1
        }
    }

    fn set_surface_scaling(&mut self, output_scale: i32) {
        let old_scale = self.scaling;
        self.scaling = self.target_scaling(output_scale);
        let factor = old_scale as f64 / self.scaling as f64;
        self.vdparams.scale_extent(factor);
        self.window_size.scale_extent(factor);
    }

    fn set_geometry(&mut self) {
        let (width, height) = if self.opts.width > 0 && self.opts.height > 0 {
            (self.opts.width, self.opts.height)
        } else {
            self.video_size
        };
        self.reduced = reduce_aspect(width, height);
        self.vdparams = Rect::from_size(width / self.scaling, height / self.scaling);
    }

    /// First output the surface is placed on.
    pub fn attach_output(&mut self, output_scale: i32) {
        if self.has_output {
            return;
        }
        self.has_output = true;
        self.set_surface_scaling(output_scale);
        self.events |= VoEvents::DPI;
    }

    /// `wl_surface.enter` for an output with the given scale.
    pub fn surface_entered(&mut self, output_scale: i32, output_geometry_changed: bool) {
        let old_geometry = self.geometry;
        let mut force_resize = false;

        if self.target_scaling(output_scale) != self.scaling {
            self.set_surface_scaling(output_scale);
            force_resize = true;
            self.events |= VoEvents::DPI;
        }
        if output_geometry_changed {
            self.set_geometry();
            force_resize = true;
        }
        if old_geometry != self.geometry || force_resize {
            self.events |= VoEvents::RESIZE;
        }
        self.events |= VoEvents::WIN_STATE;
    }

    pub fn surface_left(&mut self) {
        self.events |= VoEvents::WIN_STATE;
    }

    /// `wl_output.done`. Changes to the current output recompute everything.
    pub fn output_done(&mut self, is_current: bool, output_scale: i32) {
        if is_current {
            self.set_surface_scaling(output_scale);
            self.set_geometry();
            self.events |= VoEvents::DPI | VoEvents::RESIZE;
        }
        self.events |= VoEvents::WIN_STATE;
    }

    /// New video parameters, in pixels.
    pub fn reconfig(&mut self, video_width: i32, video_height: i32) {
        debug!(video_width, video_height, "reconfiguring window");
        self.video_size = (video_width, video_height);
        self.set_geometry();
        self.window_size = self.vdparams;

        if self.opts.configure_bounds {
            self.apply_bounds();
        }

        let fullscreen = self.fullscreen.desired();
        let maximized = self.maximized.desired();
        if (!fullscreen && !maximized) || self.geometry.is_empty() {
            self.geometry = self.window_size;
        }

        if fullscreen {
            self.state_change = true;
            self.push_request(ShellRequest::SetFullscreen);
        }
        if maximized {
            self.state_change = true;
            self.push_request(ShellRequest::SetMaximized);
        }
        if self.minimized {
            self.push_request(ShellRequest::SetMinimized);
        }
        self.events |= VoEvents::RESIZE;
    }

    fn apply_bounds(&mut self) {
        let (width, height) = self.bounds;
        if width > 0 && width < self.window_size.x1 {
            self.window_size.x1 = width;
        }
        if height > 0 && height < self.window_size.y1 {
            self.window_size.y1 = height;
        }
    }

    pub fn configure_bounds(&mut self, width: i32, height: i32) {
        self.bounds = (width, height);
    }

    /// Stores the configure until the surface configure that ends the sequence.
    pub fn toplevel_configure(&mut self, width: i32, height: i32, states: ToplevelStates) {
        self.pending_configure = Some(ToplevelConfigure {
            width,
            height,
            states,
        });
        self.phase = Phase::Configuring;
    }

    /// Called once the configure sequence has been acknowledged. Returns
    /// true when the toplevel just became activated.
    pub fn surface_configure(&mut self) -> bool {
        let was_activated = self.activated;
        if let Some(configure) = self.pending_configure.take() {
            self.apply_toplevel_configure(configure);
        }
        self.phase = Phase::Steady;
        !was_activated && self.activated
    }

    fn apply_toplevel_configure(&mut self, configure: ToplevelConfigure) {
        let ToplevelConfigure {
            mut width,
            mut height,
            states,
        } = configure;
        let old_geometry = self.geometry;
        let old_toplevel_size = self.toplevel_size;
        self.toplevel_size = (width, height);

        if self.geometry.is_empty() {
            return;
        }

        let is_fullscreen = states.is_fullscreen();
        let is_maximized = states.is_maximized();
        let is_activated = states.contains(ToplevelStates::ACTIVATED);

        if is_activated {
            self.minimized = false;
        }

        if self.fullscreen.desired() != is_fullscreen {
            self.state_change = true;
        }
        self.fullscreen.confirm(is_fullscreen);

        if self.maximized.desired() != is_maximized {
            self.state_change = true;
        }
        self.maximized.confirm(is_maximized);

        if let Some(mode) = self.decoration.in_flight() {
            self.requests.push(ShellRequest::SetDecorationMode(mode));
        }

        if self.activated != is_activated {
            self.activated = is_activated;
            self.update_focus();
            if self.activated {
                self.events |= VoEvents::EXPOSE;
            }
        }

        let resize = 'resize: {
            if self.state_change && !is_fullscreen && !is_maximized {
                self.geometry = self.window_size;
                self.state_change = false;
                break 'resize true;
            }

            if width == 0 || height == 0 {
                if !is_fullscreen && !is_maximized {
                    self.geometry = self.window_size;
                }
                break 'resize true;
            }

            if old_toplevel_size == self.toplevel_size {
                break 'resize false;
            }

            if !is_fullscreen && !is_maximized {
                if self.opts.keepaspect {
                    let (reduced_w, reduced_h) = self.reduced;
                    let scale_factor = width as f64 / reduced_w as f64;
                    width = (reduced_w as f64 * scale_factor).ceil() as i32;
                    if self.opts.keepaspect_window {
                        height = (reduced_h as f64 * scale_factor).ceil() as i32;
                    }
                }
                self.window_size = Rect::from_size(width, height);
            }
            self.geometry = Rect::from_size(width, height);
            old_geometry != self.geometry
        };

        if resize {
            debug!(
                "Resizing due to xdg from {}x{} to {}x{}",
                old_geometry.width() * self.scaling,
                old_geometry.height() * self.scaling,
                self.geometry.width() * self.scaling,
                self.geometry.height() * self.scaling
            );
            self.events |= VoEvents::RESIZE;
        }
    }

    pub fn decoration_configure(&mut self, mode: DecorationMode) {
        if let Some(requested) = self.decoration.in_flight() {
            if requested != mode {
                debug!(
                    "Requested {} decorations but compositor responded with {}. \
                     It is likely that compositor wants us to stay in a given mode.",
                    requested.as_str(),
                    mode.as_str()
                );
            }
        }
        self.decoration.confirm(mode);
        match mode {
            DecorationMode::ServerSide => debug!("Enabling server decorations"),
            DecorationMode::ClientSide => debug!("Disabling server decorations"),
        }
    }

    pub fn keyboard_focus(&mut self, has_focus: bool) {
        self.has_keyboard_input = has_focus;
        self.update_focus();
    }

    fn update_focus(&mut self) {
        let focused = self.activated && self.has_keyboard_input;
        if focused != self.focused {
            self.focused = focused;
            self.events |= VoEvents::FOCUS;
        }
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        if self.fullscreen.desired() == fullscreen {
            return;
        }
        self.fullscreen.request(fullscreen);
        self.state_change = true;
        self.push_request(if fullscreen {
            ShellRequest::SetFullscreen
        } else {
            ShellRequest::UnsetFullscreen
        });
    }

    pub fn set_maximized(&mut self, maximized: bool) {
        if self.maximized.desired() == maximized {
            return;
        }
        self.maximized.request(maximized);
        self.state_change = true;
        self.push_request(if maximized {
            ShellRequest::SetMaximized
        } else {
            ShellRequest::UnsetMaximized
        });
    }

    /// Minimizing can't be undone by the client and is never confirmed.
    pub fn set_minimized(&mut self, minimized: bool) {
        self.minimized = minimized;
        if minimized {
            self.push_request(ShellRequest::SetMinimized);
        }
    }

    pub fn set_border(&mut self, border: bool) {
        if !self.has_decoration_manager {
            self.decoration.confirm(DecorationMode::ClientSide);
            return;
        }
        let mode = DecorationMode::from_border(border);
        self.decoration.request(mode);
        self.push_request(ShellRequest::SetDecorationMode(mode));
    }

    /// Explicit window size in pixels; 0x0 follows the video again.
    pub fn set_window_size(&mut self, width: i32, height: i32) {
        self.opts.width = width;
        self.opts.height = height;
        if !self.has_output {
            return;
        }
        self.set_geometry();
        self.window_size = self.vdparams;
        if !self.fullscreen.get() && !self.maximized.get() {
            self.geometry = self.window_size;
        }
        self.mark_speculative();
        self.events |= VoEvents::RESIZE;
    }

    pub fn set_title(&mut self, title: &[u8]) {
        let title = String::from_utf8_lossy(title).into_owned();
        self.push_request(ShellRequest::SetTitle(title));
    }

    pub fn set_app_id(&mut self, app_id: &str) {
        self.push_request(ShellRequest::SetAppId(app_id.to_owned()));
    }

    /// Un-fullscreened window size in pixels.
    pub fn unfs_window_size(&self) -> (i32, i32) {
        let rect = if self.maximized.get() {
            self.geometry
        } else {
            self.window_size
        };
        (rect.width() * self.scaling, rect.height() * self.scaling)
    }

    /// Sets the un-fullscreened size in pixels. While maximized this first
    /// asks to unmaximize; the size is applied once the compositor agrees.
    pub fn set_unfs_window_size(&mut self, width: i32, height: i32) {
        self.window_size = Rect::from_size(width / self.scaling, height / self.scaling);
        if self.fullscreen.get() {
            return;
        }
        if self.maximized.get() {
            self.set_maximized(false);
            return;
        }
        self.geometry = self.window_size;
        self.mark_speculative();
        self.events |= VoEvents::RESIZE;
    }

    /// Left button press at a surface-local position.
    pub fn pointer_pressed(&self, x: f64, y: f64) -> Option<ShellRequest> {
        if self.fullscreen.get() || self.maximized.get() {
            return None;
        }
        Some(self.grab(x, y, self.opts.edge_pixels_pointer))
    }

    pub fn touch_down(&self, x: f64, y: f64) -> ShellRequest {
        self.grab(x, y, self.opts.edge_pixels_touch)
    }

    fn grab(&self, x: f64, y: f64, edge_pixels: i32) -> ShellRequest {
        if self.fullscreen.get() || self.maximized.get() || self.border() {
            return ShellRequest::Move;
        }
        match check_for_resize(
            x,
            y,
            edge_pixels,
            self.geometry.width(),
            self.geometry.height(),
        ) {
            Some(edge) => ShellRequest::Resize(edge),
            None => ShellRequest::Move,
        }
    }

    pub fn hidpi_scale(&self) -> Option<f64> {
        (self.scaling > 0).then_some(self.scaling as f64)
    }

    pub(crate) fn warn_if_unconfigured(&self) {
        if self.phase == Phase::Unconfigured {
            warn!("surface has not been configured by the compositor yet");
        }
    }
}
