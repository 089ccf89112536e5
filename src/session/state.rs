use smithay_client_toolkit::{
    compositor::{CompositorState, Region},
    output::OutputState,
    registry::RegistryState,
    seat::SeatState,
    shm::Shm,
};
use tracing::{debug, warn};
use wayland_client::{
    protocol::{
        wl_keyboard::WlKeyboard, wl_output::WlOutput, wl_pointer::WlPointer, wl_seat::WlSeat,
        wl_subcompositor::WlSubcompositor, wl_subsurface::WlSubsurface, wl_surface::WlSurface,
        wl_touch::WlTouch,
    },
    QueueHandle,
};
use wayland_protocols::{
    wp::{
        idle_inhibit::zv1::client::{
            zwp_idle_inhibit_manager_v1::ZwpIdleInhibitManagerV1,
            zwp_idle_inhibitor_v1::ZwpIdleInhibitorV1,
        },
        linux_dmabuf::zv1::client::{
            zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1,
            zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        },
        presentation_time::client::wp_presentation::WpPresentation,
        viewporter::client::{wp_viewport::WpViewport, wp_viewporter::WpViewporter},
    },
    xdg::{
        decoration::zv1::client::{
            zxdg_decoration_manager_v1::ZxdgDecorationManagerV1,
            zxdg_toplevel_decoration_v1::{self, ZxdgToplevelDecorationV1},
        },
        shell::client::{
            xdg_surface::XdgSurface,
            xdg_toplevel::{self, XdgToplevel},
            xdg_wm_base::XdgWmBase,
        },
    },
};

use super::output::{find_output, OutputSummary};
use crate::buffer::SolidBuffer;
use crate::format::FormatCatalog;
use crate::present::FramePacer;
use crate::window::{letterbox, DecorationMode, Rect, ResizeEdge, ShellRequest, WindowState};

/// The video subsurface, placed over the letterboxed rectangle.
#[derive(Debug)]
pub struct VideoSurface {
    pub surface: WlSurface,
    pub subsurface: WlSubsurface,
    pub viewport: Option<WpViewport>,
}

/// Dispatch target of the session event queue.
pub struct SessionState {
    pub(super) registry_state: RegistryState,
    pub(super) compositor_state: CompositorState,
    pub(super) output_state: OutputState,
    pub(super) seat_state: SeatState,
    pub(super) shm: Shm,
    pub(super) qh: QueueHandle<SessionState>,

    pub(super) wm_base: XdgWmBase,
    pub(super) surface: WlSurface,
    pub(super) xdg_surface: XdgSurface,
    pub(super) toplevel: XdgToplevel,
    pub(super) viewport: Option<WpViewport>,
    pub(super) video: Option<VideoSurface>,
    pub(super) solid_buffer: Option<SolidBuffer>,

    pub(super) subcompositor: Option<WlSubcompositor>,
    pub(super) viewporter: Option<WpViewporter>,
    pub(super) decoration_manager: Option<ZxdgDecorationManagerV1>,
    pub(super) toplevel_decoration: Option<ZxdgToplevelDecorationV1>,
    pub(super) presentation: Option<WpPresentation>,
    pub(super) dmabuf: Option<ZwpLinuxDmabufV1>,
    pub(super) dmabuf_feedback: Option<ZwpLinuxDmabufFeedbackV1>,
    pub(super) idle_inhibit_manager: Option<ZwpIdleInhibitManagerV1>,
    pub(super) idle_inhibitor: Option<ZwpIdleInhibitorV1>,

    pub(super) seat: Option<WlSeat>,
    pub(super) pointer: Option<WlPointer>,
    pub(super) keyboard: Option<WlKeyboard>,
    pub(super) touch: Option<WlTouch>,

    pub(super) catalog: FormatCatalog,
    pub(super) window: WindowState,
    pub(super) pacer: FramePacer,

    pub(super) current_output: Option<WlOutput>,
    pub(super) entered_outputs: Vec<WlOutput>,
    pub(super) fs_screen_id: Option<usize>,
    pub(super) fs_screen_name: Option<String>,

    pub(super) close_requested: bool,
}

impl SessionState {
    /// The surface video buffers are attached to.
    pub(super) fn video_surface(&self) -> &WlSurface {
        self.video
            .as_ref()
            .map(|video| &video.surface)
            .unwrap_or(&self.surface)
    }

    pub(super) fn outputs(&self) -> Vec<(WlOutput, OutputSummary)> {
        self.output_state
            .outputs()
            .filter_map(|output| {
                let info = self.output_state.info(&output)?;
                let summary = OutputSummary::from_info(&info, self.entered_outputs.contains(&output));
                Some((output, summary))
            })
            .collect()
    }

    pub(super) fn output_summary(&self, output: &WlOutput) -> Option<OutputSummary> {
        self.output_state
            .info(output)
            .map(|info| OutputSummary::from_info(&info, self.entered_outputs.contains(output)))
    }

    pub(super) fn current_summary(&self) -> Option<OutputSummary> {
        self.current_output
            .as_ref()
            .and_then(|output| self.output_summary(output))
    }

    pub(super) fn select_output(&self) -> Option<WlOutput> {
        let outputs = self.outputs();
        let summaries: Vec<_> = outputs.iter().map(|(_, summary)| summary.clone()).collect();
        let index = find_output(&summaries, self.fs_screen_id, self.fs_screen_name.as_deref())?;
        outputs.into_iter().nth(index).map(|(output, _)| output)
    }

    /// Sends everything the window state machine queued.
    pub(super) fn flush_shell_requests(&mut self) {
        for request in self.window.take_requests() {
            self.send_shell_request(request, None);
        }
    }

    pub(super) fn send_shell_request(&mut self, request: ShellRequest, serial: Option<u32>) {
        match request {
            ShellRequest::SetFullscreen => {
                let output = self.select_output();
                self.toplevel.set_fullscreen(output.as_ref());
            }
            ShellRequest::UnsetFullscreen => self.toplevel.unset_fullscreen(),
            ShellRequest::SetMaximized => self.toplevel.set_maximized(),
            ShellRequest::UnsetMaximized => self.toplevel.unset_maximized(),
            ShellRequest::SetMinimized => self.toplevel.set_minimized(),
            ShellRequest::SetDecorationMode(mode) => {
                if let Some(decoration) = &self.toplevel_decoration {
                    decoration.set_mode(match mode {
                        DecorationMode::ServerSide => zxdg_toplevel_decoration_v1::Mode::ServerSide,
                        DecorationMode::ClientSide => zxdg_toplevel_decoration_v1::Mode::ClientSide,
                    });
                }
            }
            ShellRequest::SetTitle(title) => self.toplevel.set_title(title),
            ShellRequest::SetAppId(app_id) => self.toplevel.set_app_id(app_id),
            ShellRequest::Move => match (&self.seat, serial) {
                (Some(seat), Some(serial)) => self.toplevel._move(seat, serial),
                _ => debug!("move requested without an input serial"),
            },
            ShellRequest::Resize(edge) => match (&self.seat, serial) {
                (Some(seat), Some(serial)) => self.toplevel.resize(seat, serial, to_xdg_edge(edge)),
                _ => debug!("resize requested without an input serial"),
            },
        }
    }

    /// Applies the window geometry to the surfaces: opaque region, viewport
    /// destinations and the video subsurface position.
    pub(super) fn resize(&mut self) {
        profiling::scope!("SessionState::resize");
        let geometry = self.window.geometry();
        let (width, height) = geometry.size();
        if width <= 0 || height <= 0 {
            debug!(width, height, "skipping resize to an empty window");
            return;
        }

        let dst = if self.window.keepaspect() {
            let (video_w, video_h) = self.window.video_size();
            letterbox(video_w, video_h, Rect::from_size(width, height))
        } else {
            Rect::from_size(width, height)
        };
        debug!(
            width,
            height,
            dst_x = dst.x0,
            dst_y = dst.y0,
            dst_w = dst.width(),
            dst_h = dst.height(),
            "resizing surfaces"
        );

        match Region::new(&self.compositor_state) {
            Ok(region) => {
                region.add(0, 0, width, height);
                self.surface.set_opaque_region(Some(region.wl_region()));
            }
            Err(err) => warn!("failed to create opaque region: {err}"),
        }

        if let Some(viewport) = &self.viewport {
            viewport.set_destination(2 * dst.x0 + dst.width(), 2 * dst.y0 + dst.height());
        }
        if let Some(video) = &self.video {
            if let Some(viewport) = &video.viewport {
                if dst.width() > 0 && dst.height() > 0 {
                    viewport.set_destination(dst.width(), dst.height());
                }
            }
            video.subsurface.set_position(dst.x0, dst.y0);
        }
        self.surface.commit();
    }

    pub(super) fn request_feedback(&self) {
        if let Some(presentation) = &self.presentation {
            presentation.feedback(&self.surface, &self.qh, ());
        }
    }

    /// Enables or disables the idle inhibitor. `false` when unsupported.
    pub(super) fn set_idle_inhibit(&mut self, enable: bool) -> bool {
        let Some(manager) = &self.idle_inhibit_manager else {
            return false;
        };
        match (enable, self.idle_inhibitor.take()) {
            (true, None) => {
                debug!("Enabling idle inhibitor");
                self.idle_inhibitor = Some(manager.create_inhibitor(&self.surface, &self.qh, ()));
            }
            (false, Some(inhibitor)) => {
                debug!("Disabling the idle inhibitor");
                inhibitor.destroy();
            }
            (_, inhibitor) => self.idle_inhibitor = inhibitor,
        }
        true
    }
}

fn to_xdg_edge(edge: ResizeEdge) -> xdg_toplevel::ResizeEdge {
    match edge {
        ResizeEdge::Top => xdg_toplevel::ResizeEdge::Top,
        ResizeEdge::Bottom => xdg_toplevel::ResizeEdge::Bottom,
        ResizeEdge::Left => xdg_toplevel::ResizeEdge::Left,
        ResizeEdge::TopLeft => xdg_toplevel::ResizeEdge::TopLeft,
        ResizeEdge::BottomLeft => xdg_toplevel::ResizeEdge::BottomLeft,
        ResizeEdge::Right => xdg_toplevel::ResizeEdge::Right,
        ResizeEdge::TopRight => xdg_toplevel::ResizeEdge::TopRight,
        ResizeEdge::BottomRight => xdg_toplevel::ResizeEdge::BottomRight,
    }
}
