//! The Wayland side of the video output.
//!
//! [`OutputSession`] owns the display connection, the surfaces and every
//! protocol object bound for them, together with the format catalog, buffer
//! pool, window state and frame pacer. The video driver calls into it from a
//! single thread; only [`OutputSession::wakeup`] is meant to be triggered
//! while another call blocks.

mod handlers;
mod output;
mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use smithay_client_toolkit::{
    compositor::{CompositorState, Region},
    output::OutputState,
    registry::RegistryState,
    seat::SeatState,
    shm::Shm,
};
use tracing::{debug, info, warn};
use wayland_client::{
    globals::{registry_queue_init, GlobalList},
    protocol::{
        wl_subcompositor::WlSubcompositor, wl_subsurface::WlSubsurface,
        wl_surface::WlSurface,
    },
    Connection, Dispatch, EventQueue, Proxy, QueueHandle,
};
use wayland_protocols::{
    wp::{
        idle_inhibit::zv1::client::zwp_idle_inhibit_manager_v1::ZwpIdleInhibitManagerV1,
        linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        presentation_time::client::wp_presentation::WpPresentation,
        viewporter::client::wp_viewporter::WpViewporter,
    },
    xdg::{
        decoration::zv1::client::zxdg_decoration_manager_v1::ZxdgDecorationManagerV1,
        shell::client::xdg_wm_base::XdgWmBase,
    },
};

pub use output::{find_output, OutputSummary};
use state::{SessionState, VideoSurface};

use crate::buffer::{BufferPool, SolidBuffer, WaylandDmabufAllocator};
use crate::config::Config;
use crate::error::{PoolError, SessionError};
use crate::event_loop::{clamp_wait, DisplayPoller, PollStatus};
use crate::format::{FormatCatalog, FormatEntry};
use crate::hwdec::{HwdecBackend, VaSurfaceExporter, VideoFrame};
use crate::present::{FramePacer, PacerOptions, VsyncInfo};
use crate::window::{Phase, VoEvents, WindowOptions, WindowState};

type DmabufPool = BufferPool<WaylandDmabufAllocator<SessionState>>;

pub struct OutputSession {
    queue: EventQueue<SessionState>,
    state: SessionState,
    poller: DisplayPoller,
    pool: Option<DmabufPool>,
    va_display: Option<Arc<dyn VaSurfaceExporter>>,
    reset_window: u32,
}

fn bind_optional<I>(
    globals: &GlobalList,
    qh: &QueueHandle<SessionState>,
    version: std::ops::RangeInclusive<u32>,
) -> Option<I>
where
    I: Proxy + 'static,
    SessionState: Dispatch<I, ()>,
{
    match globals.bind::<I, _, _>(qh, version, ()) {
        Ok(proxy) => Some(proxy),
        Err(err) => {
            debug!("{} is not available: {err}", I::interface().name);
            None
        }
    }
}

impl OutputSession {
    /// Connects to `WAYLAND_DISPLAY`, binds the globals and maps the window.
    pub fn connect(config: &Config) -> Result<Self, SessionError> {
        let conn = Connection::connect_to_env()?;
        let (globals, mut queue) = registry_queue_init::<SessionState>(&conn)?;
        let qh = queue.handle();

        let compositor_state =
            CompositorState::bind(&globals, &qh).map_err(|source| SessionError::MissingProtocol {
                interface: "wl_compositor",
                source,
            })?;
        let shm = Shm::bind(&globals, &qh).map_err(|source| SessionError::MissingProtocol {
            interface: "wl_shm",
            source,
        })?;
        let wm_base: XdgWmBase = globals
            .bind(&qh, 1..=6, ())
            .map_err(|source| SessionError::MissingProtocol {
                interface: "xdg_wm_base",
                source,
            })?;

        let subcompositor: Option<WlSubcompositor> = bind_optional(&globals, &qh, 1..=1);
        let viewporter: Option<WpViewporter> = bind_optional(&globals, &qh, 1..=1);
        let presentation: Option<WpPresentation> = bind_optional(&globals, &qh, 1..=1);
        let decoration_manager: Option<ZxdgDecorationManagerV1> =
            bind_optional(&globals, &qh, 1..=1);
        let idle_inhibit_manager: Option<ZwpIdleInhibitManagerV1> =
            bind_optional(&globals, &qh, 1..=1);
        let dmabuf: Option<ZwpLinuxDmabufV1> = bind_optional(&globals, &qh, 2..=4);
        let seat_state = SeatState::new(&globals, &qh);
        let seat = seat_state.seats().next();

        let surface = compositor_state.create_surface(&qh);
        let xdg_surface = wm_base.get_xdg_surface(&surface, &qh, ());
        let toplevel = xdg_surface.get_toplevel(&qh, ());

        let viewport = viewporter
            .as_ref()
            .map(|viewporter| viewporter.get_viewport(&surface, &qh, ()));

        let video = match &subcompositor {
            Some(subcompositor) => {
                let video_surface = compositor_state.create_surface(&qh);
                let subsurface: WlSubsurface =
                    subcompositor.get_subsurface(&video_surface, &surface, &qh, ());
                subsurface.set_desync();
                match Region::new(&compositor_state) {
                    Ok(region) => video_surface.set_input_region(Some(region.wl_region())),
                    Err(err) => warn!("failed to create input region: {err}"),
                }
                let viewport = viewporter
                    .as_ref()
                    .map(|viewporter| viewporter.get_viewport(&video_surface, &qh, ()));
                Some(VideoSurface {
                    surface: video_surface,
                    subsurface,
                    viewport,
                })
            }
            None => {
                warn!("Compositor doesn't support the wl_subcompositor protocol, video is attached to the main surface");
                None
            }
        };
        if viewporter.is_none() {
            warn!("Compositor doesn't support the wp_viewporter protocol");
        }
        if presentation.is_none() {
            info!("Compositor doesn't support the wp_presentation protocol, frame timing falls back to roundtrips");
        }
        if idle_inhibit_manager.is_none() {
            debug!("Compositor doesn't support the zwp_idle_inhibit_manager_v1 protocol");
        }

        let toplevel_decoration = match &decoration_manager {
            Some(manager) => Some(manager.get_toplevel_decoration(&toplevel, &qh, ())),
            None => {
                debug!("Compositor doesn't support the zxdg_decoration_manager_v1 protocol");
                None
            }
        };

        let dmabuf_feedback = match &dmabuf {
            Some(dmabuf) => (dmabuf.version() >= 4).then(|| dmabuf.get_default_feedback(&qh, ())),
            None => {
                warn!("Compositor doesn't support the zwp_linux_dmabuf_v1 protocol, no frame can be shown");
                None
            }
        };

        let window_config = &config.window;
        let mut state = SessionState {
            registry_state: RegistryState::new(&globals),
            compositor_state,
            output_state: OutputState::new(&globals, &qh),
            seat_state,
            shm,
            qh: qh.clone(),
            wm_base,
            surface,
            xdg_surface,
            toplevel,
            viewport,
            video,
            solid_buffer: None,
            subcompositor,
            viewporter,
            decoration_manager,
            toplevel_decoration,
            presentation,
            dmabuf,
            dmabuf_feedback,
            idle_inhibit_manager,
            idle_inhibitor: None,
            seat,
            pointer: None,
            keyboard: None,
            touch: None,
            catalog: FormatCatalog::new(),
            window: WindowState::new(WindowOptions::from_config(config)),
            pacer: FramePacer::new(PacerOptions::from_config(config)),
            current_output: None,
            entered_outputs: Vec::new(),
            fs_screen_id: window_config.fs_screen_id,
            fs_screen_name: window_config.fs_screen_name.clone(),
            close_requested: false,
        };

        let poller = DisplayPoller::new()?;

        // Outputs, format lists and the presentation clock arrive here.
        queue.roundtrip(&mut state)?;
        if state.output_state.outputs().next().is_none() {
            return Err(SessionError::NoOutputs);
        }

        let has_decorations = state.toplevel_decoration.is_some();
        state.window.init_decorations(has_decorations);
        state.window.set_title(window_config.title.as_bytes());
        state.window.set_app_id(&window_config.app_id);
        state.flush_shell_requests();

        state.surface.frame(&qh, state.surface.clone());
        state.surface.commit();
        queue.roundtrip(&mut state)?;

        info!(
            formats = state.catalog.len(),
            negotiation = ?state.catalog.negotiation(),
            presentation = state.pacer.uses_presentation(),
            "wayland output session ready"
        );

        Ok(Self {
            queue,
            state,
            poller,
            pool: None,
            va_display: None,
            reset_window: config.pool.reset_window,
        })
    }

    /// Makes the VA-API importer available. Must happen before the pool holds
    /// buffers from another backend.
    pub fn set_va_display(
        &mut self,
        display: Arc<dyn VaSurfaceExporter>,
    ) -> Result<(), PoolError> {
        if let Some(pool) = &mut self.pool {
            pool.bind(HwdecBackend::probe(Some(display.clone())))?;
        }
        self.va_display = Some(display);
        Ok(())
    }

    fn ensure_pool<'a>(
        pool: &'a mut Option<DmabufPool>,
        state: &SessionState,
        va_display: &Option<Arc<dyn VaSurfaceExporter>>,
        reset_window: u32,
    ) -> &'a mut DmabufPool {
        pool.get_or_insert_with(|| {
            let allocator = WaylandDmabufAllocator::new(state.dmabuf.clone(), state.qh.clone());
            let mut pool = BufferPool::new(allocator, reset_window);
            if let Err(err) = pool.bind(HwdecBackend::probe(va_display.clone())) {
                warn!("failed to bind the hardware decode backend: {err}");
            }
            pool
        })
    }

    /// Attaches the frame to the video surface. Returns whether something
    /// was attached; the commit happens in [`Self::flip_page`].
    pub fn draw_frame(&mut self, frame: &VideoFrame) -> bool {
        profiling::scope!("OutputSession::draw_frame");
        if !self.state.pacer.check_visible() {
            return false;
        }

        let pool = Self::ensure_pool(
            &mut self.pool,
            &self.state,
            &self.va_display,
            self.reset_window,
        );
        pool.begin_cycle();
        let Some(entry) = pool.get_entry(frame, &self.state.catalog) else {
            return false;
        };
        debug!(identity = entry.identity.0, format = %entry.format, "Schedule buffer pool entry");

        let surface: &WlSurface = self.state.video_surface();
        surface.attach(Some(&entry.buffer), 0, 0);
        surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        true
    }

    /// Commits the frame and, unless vsync is disabled, waits for the
    /// compositor to ask for the next one.
    pub fn flip_page(&mut self) -> Result<(), SessionError> {
        profiling::scope!("OutputSession::flip_page");
        if let Some(video) = &self.state.video {
            video.surface.commit();
        }
        self.state.surface.commit();

        if !self.state.pacer.options().disable_vsync {
            self.wait_frame()?;
        }
        self.state.pacer.swap();
        Ok(())
    }

    fn wait_frame(&mut self) -> Result<(), SessionError> {
        profiling::scope!("OutputSession::wait_frame");
        let refresh = self.display_fps();
        let deadline = Instant::now() + self.state.pacer.frame_deadline(refresh);

        while self.state.pacer.is_waiting() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.dispatch(Some(deadline - now), false)? == PollStatus::Closed {
                break;
            }
        }

        // Without presentation feedback the wait above may return before the
        // compositor processed the commit.
        if !self.state.pacer.uses_presentation() && !self.poller.is_closed() {
            self.queue.roundtrip(&mut self.state)?;
        }

        self.state.pacer.finish_wait();
        Ok(())
    }

    fn dispatch(
        &mut self,
        timeout: Option<Duration>,
        watch_wakeup: bool,
    ) -> Result<PollStatus, SessionError> {
        let status = self
            .poller
            .dispatch(&mut self.queue, &mut self.state, timeout, watch_wakeup)?;
        if status == PollStatus::Closed {
            self.state.close_requested = true;
        }
        Ok(status)
    }

    /// Clears the pool over the next display cycles, e.g. after a seek.
    pub fn reset(&mut self) {
        if let Some(pool) = &mut self.pool {
            pool.request_reset();
        }
    }

    pub fn clear_pool(&mut self) {
        if let Some(pool) = &mut self.pool {
            pool.clear();
        }
    }

    /// New video size in pixels.
    pub fn reconfig(&mut self, width: i32, height: i32) -> Result<(), SessionError> {
        if self.state.window.phase() == Phase::Unconfigured {
            self.queue.roundtrip(&mut self.state)?;
            self.state.window.warn_if_unconfigured();
        }

        if self.state.solid_buffer.is_none()
            && self.state.viewport.is_some()
            && self.state.video.is_some()
        {
            let solid = SolidBuffer::new(self.state.shm.wl_shm(), &self.state.qh)?;
            self.state.surface.attach(Some(solid.wl_buffer()), 0, 0);
            self.state.solid_buffer = Some(solid);
        }

        if self.state.current_output.is_none() {
            let output = self.state.select_output().ok_or(SessionError::NoOutputs)?;
            let scale = self
                .state
                .output_summary(&output)
                .map(|summary| summary.scale)
                .unwrap_or(1);
            self.state.current_output = Some(output);
            self.state.window.attach_output(scale);
        }

        self.state.window.reconfig(width, height);
        self.state.flush_shell_requests();
        self.state.surface.commit();
        self.queue.flush()?;
        Ok(())
    }

    /// Dispatches what is pending without blocking and returns the events
    /// the driver has to handle. A resize is applied to the surfaces here.
    pub fn check_events(&mut self) -> Result<VoEvents, SessionError> {
        self.dispatch(Some(Duration::ZERO), false)?;
        self.state.flush_shell_requests();

        let events = self.state.window.take_events();
        if events.contains(VoEvents::RESIZE) {
            self.state.pacer.reset_visibility();
            self.state.resize();
        }
        Ok(events)
    }

    /// Blocks until `until`, a compositor event or [`Self::wakeup`].
    pub fn wait_events(&mut self, until: Instant) -> Result<(), SessionError> {
        if self.poller.is_closed() {
            return Ok(());
        }
        let timeout = clamp_wait(until, Instant::now());
        self.dispatch(Some(timeout), true)?;
        Ok(())
    }

    pub fn wakeup(&self) {
        self.poller.wakeup();
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        self.state.window.set_fullscreen(fullscreen);
        self.state.flush_shell_requests();
    }

    pub fn set_maximized(&mut self, maximized: bool) {
        self.state.window.set_maximized(maximized);
        self.state.flush_shell_requests();
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        self.state.window.set_minimized(minimized);
        self.state.flush_shell_requests();
    }

    pub fn set_border(&mut self, border: bool) {
        self.state.window.set_border(border);
        self.state.flush_shell_requests();
    }

    pub fn set_window_size(&mut self, width: i32, height: i32) {
        self.state.window.set_window_size(width, height);
    }

    pub fn set_title(&mut self, title: &[u8]) {
        self.state.window.set_title(title);
        self.state.flush_shell_requests();
    }

    pub fn set_app_id(&mut self, app_id: &str) {
        self.state.window.set_app_id(app_id);
        self.state.flush_shell_requests();
    }

    /// Returns `false` when the compositor can't inhibit idling.
    pub fn set_idle_inhibit(&mut self, enable: bool) -> bool {
        self.state.set_idle_inhibit(enable)
    }

    pub fn unfs_window_size(&self) -> (i32, i32) {
        self.state.window.unfs_window_size()
    }

    pub fn set_unfs_window_size(&mut self, width: i32, height: i32) {
        self.state.window.set_unfs_window_size(width, height);
        self.state.flush_shell_requests();
    }

    pub fn is_visible(&self) -> bool {
        self.state.pacer.is_visible()
    }

    pub fn vsync_info(&self) -> Option<VsyncInfo> {
        self.state.pacer.vsync_info()
    }

    /// Refresh rate of the output the surface is on.
    pub fn display_fps(&self) -> Option<f64> {
        self.state
            .current_summary()
            .map(|summary| summary.refresh_hz)
            .filter(|hz| *hz > 0.0)
    }

    pub fn display_resolution(&self) -> Option<(i32, i32)> {
        self.state
            .current_summary()
            .map(|summary| summary.geometry.size())
            .filter(|(width, height)| *width > 0 && *height > 0)
    }

    /// Names of every output the surface is currently on.
    pub fn display_names(&self) -> Vec<String> {
        self.state
            .outputs()
            .into_iter()
            .filter(|(_, summary)| summary.has_surface)
            .map(|(_, summary)| summary.display_name().to_owned())
            .collect()
    }

    pub fn outputs(&self) -> Vec<OutputSummary> {
        self.state
            .outputs()
            .into_iter()
            .map(|(_, summary)| summary)
            .collect()
    }

    pub fn formats(&self) -> Vec<FormatEntry> {
        self.state.catalog.entries()
    }

    pub fn catalog(&self) -> &FormatCatalog {
        &self.state.catalog
    }

    pub fn window(&self) -> &WindowState {
        &self.state.window
    }

    pub fn hidpi_scale(&self) -> Option<f64> {
        self.state.window.hidpi_scale()
    }

    pub fn focused(&self) -> bool {
        self.state.window.focused()
    }

    /// The compositor or a broken connection asked to close the window.
    pub fn close_requested(&self) -> bool {
        self.state.close_requested
    }

    pub fn is_closed(&self) -> bool {
        self.poller.is_closed()
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.free();
        }
        let state = &mut self.state;
        state.solid_buffer.take();
        if let Some(inhibitor) = state.idle_inhibitor.take() {
            inhibitor.destroy();
        }
        if let Some(decoration) = state.toplevel_decoration.take() {
            decoration.destroy();
        }
        if let Some(viewport) = state.viewport.take() {
            viewport.destroy();
        }
        if let Some(video) = state.video.take() {
            if let Some(viewport) = video.viewport {
                viewport.destroy();
            }
            video.subsurface.destroy();
            video.surface.destroy();
        }
        if let Some(feedback) = state.dmabuf_feedback.take() {
            feedback.destroy();
        }
        state.toplevel.destroy();
        state.xdg_surface.destroy();
        state.surface.destroy();

        if let Some(manager) = state.decoration_manager.take() {
            manager.destroy();
        }
        if let Some(manager) = state.idle_inhibit_manager.take() {
            manager.destroy();
        }
        if let Some(presentation) = state.presentation.take() {
            presentation.destroy();
        }
        if let Some(viewporter) = state.viewporter.take() {
            viewporter.destroy();
        }
        if let Some(subcompositor) = state.subcompositor.take() {
            subcompositor.destroy();
        }
        if let Some(dmabuf) = state.dmabuf.take() {
            dmabuf.destroy();
        }
        state.wm_base.destroy();
        if let Err(err) = self.queue.flush() {
            debug!("failed to flush teardown requests: {err}");
        }
    }
}
