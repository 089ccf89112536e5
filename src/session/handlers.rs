use smithay_client_toolkit::{
    compositor::CompositorHandler,
    delegate_compositor, delegate_output, delegate_pointer, delegate_registry, delegate_seat,
    delegate_shm, delegate_touch,
    output::{OutputHandler, OutputState},
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    seat::{
        pointer::{PointerEvent, PointerEventKind, PointerHandler},
        touch::TouchHandler,
        Capability, SeatHandler, SeatState,
    },
    shm::{Shm, ShmHandler},
};
use tracing::{debug, error, info, trace, warn};
use wayland_client::{
    delegate_noop, event_created_child,
    protocol::{
        wl_buffer::{self, WlBuffer},
        wl_keyboard::{self, WlKeyboard},
        wl_output::{self, WlOutput},
        wl_pointer::WlPointer,
        wl_seat::WlSeat,
        wl_shm_pool::WlShmPool,
        wl_subcompositor::WlSubcompositor,
        wl_subsurface::WlSubsurface,
        wl_surface::WlSurface,
        wl_touch::WlTouch,
    },
    Connection, Dispatch, Proxy, QueueHandle, WEnum,
};
use wayland_protocols::{
    wp::{
        idle_inhibit::zv1::client::{
            zwp_idle_inhibit_manager_v1::ZwpIdleInhibitManagerV1,
            zwp_idle_inhibitor_v1::ZwpIdleInhibitorV1,
        },
        linux_dmabuf::zv1::client::{
            zwp_linux_buffer_params_v1::{self, ZwpLinuxBufferParamsV1},
            zwp_linux_dmabuf_feedback_v1::{self, ZwpLinuxDmabufFeedbackV1},
            zwp_linux_dmabuf_v1::{self, ZwpLinuxDmabufV1},
        },
        presentation_time::client::{
            wp_presentation::{self, WpPresentation},
            wp_presentation_feedback::{self, WpPresentationFeedback},
        },
        viewporter::client::{wp_viewport::WpViewport, wp_viewporter::WpViewporter},
    },
    xdg::{
        decoration::zv1::client::{
            zxdg_decoration_manager_v1::ZxdgDecorationManagerV1,
            zxdg_toplevel_decoration_v1::{self, ZxdgToplevelDecorationV1},
        },
        shell::client::{
            xdg_surface::{self, XdgSurface},
            xdg_toplevel::{self, XdgToplevel},
            xdg_wm_base::{self, XdgWmBase},
        },
    },
};

use super::state::SessionState;
use crate::window::{DecorationMode, ToplevelStates, VoEvents};

const BTN_LEFT: u32 = 0x110;

impl CompositorHandler for SessionState {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(&mut self, _conn: &Connection, qh: &QueueHandle<Self>, surface: &WlSurface, _time: u32) {
        if *surface != self.surface {
            return;
        }
        surface.frame(qh, surface.clone());
        self.request_feedback();
        self.pacer.frame_done();
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &WlSurface,
        output: &WlOutput,
    ) {
        if *surface != self.surface {
            return;
        }
        if !self.entered_outputs.contains(output) {
            self.entered_outputs.push(output.clone());
        }
        // Scale tracking starts once reconfig picked the first output.
        if self.current_output.is_none() {
            return;
        }

        let old_geometry = self.current_summary().map(|summary| summary.geometry);
        self.current_output = Some(output.clone());
        let Some(summary) = self.current_summary() else {
            return;
        };
        info!(
            "Surface entered output {} {} (0x{:x}), scale = {}, refresh rate = {} Hz",
            summary.make,
            summary.model,
            output.id().protocol_id(),
            summary.scale,
            summary.refresh_hz
        );
        let geometry_changed = old_geometry != Some(summary.geometry);
        self.window.surface_entered(summary.scale, geometry_changed);
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &WlSurface,
        output: &WlOutput,
    ) {
        if *surface != self.surface {
            return;
        }
        self.entered_outputs.retain(|entered| entered != output);
        self.window.surface_left();
    }
}

impl OutputHandler for SessionState {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        if let Some(summary) = self.output_summary(&output) {
            debug!(
                "Registered output {} {} (0x{:x})",
                summary.make,
                summary.model,
                output.id().protocol_id()
            );
        }
        self.output_done(&output);
    }

    fn update_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        self.output_done(&output);
    }

    fn output_destroyed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        debug!("Deregistering output 0x{:x}", output.id().protocol_id());
        self.entered_outputs.retain(|entered| *entered != output);
        if self.current_output.as_ref() == Some(&output) {
            self.current_output = self.entered_outputs.first().cloned();
        }
        self.window.add_events(VoEvents::WIN_STATE);
    }
}

impl SessionState {
    fn output_done(&mut self, output: &WlOutput) {
        let is_current = self.current_output.as_ref() == Some(output);
        let scale = self
            .output_summary(output)
            .map(|summary| summary.scale)
            .unwrap_or(1);
        self.window.output_done(is_current, scale);
    }
}

impl ShmHandler for SessionState {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.shm
    }
}

impl ProvidesRegistryState for SessionState {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState, SeatState];
}

impl Dispatch<XdgWmBase, ()> for SessionState {
    fn event(
        _state: &mut Self,
        wm_base: &XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<XdgSurface, ()> for SessionState {
    fn event(
        state: &mut Self,
        xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
            if state.window.surface_configure() {
                state.pacer.reset_visibility();
            }
            state.flush_shell_requests();
        }
    }
}

fn parse_toplevel_states(raw: &[u8]) -> ToplevelStates {
    raw.chunks_exact(4)
        .filter_map(|chunk| {
            let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            xdg_toplevel::State::try_from(value).ok()
        })
        .fold(ToplevelStates::empty(), |states, state| {
            states
                | match state {
                    xdg_toplevel::State::Maximized => ToplevelStates::MAXIMIZED,
                    xdg_toplevel::State::Fullscreen => ToplevelStates::FULLSCREEN,
                    xdg_toplevel::State::Resizing => ToplevelStates::RESIZING,
                    xdg_toplevel::State::Activated => ToplevelStates::ACTIVATED,
                    xdg_toplevel::State::TiledLeft => ToplevelStates::TILED_LEFT,
                    xdg_toplevel::State::TiledRight => ToplevelStates::TILED_RIGHT,
                    xdg_toplevel::State::TiledTop => ToplevelStates::TILED_TOP,
                    xdg_toplevel::State::TiledBottom => ToplevelStates::TILED_BOTTOM,
                    xdg_toplevel::State::Suspended => ToplevelStates::SUSPENDED,
                    _ => ToplevelStates::empty(),
                }
        })
}

impl Dispatch<XdgToplevel, ()> for SessionState {
    fn event(
        state: &mut Self,
        _toplevel: &XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure {
                width,
                height,
                states,
            } => {
                let states = parse_toplevel_states(&states);
                trace!(width, height, ?states, "toplevel configure");
                state.window.toplevel_configure(width, height, states);
            }
            xdg_toplevel::Event::Close => {
                debug!("compositor asked to close the window");
                state.close_requested = true;
            }
            xdg_toplevel::Event::ConfigureBounds { width, height } => {
                state.window.configure_bounds(width, height);
            }
            _ => {}
        }
    }
}

impl Dispatch<ZxdgToplevelDecorationV1, ()> for SessionState {
    fn event(
        state: &mut Self,
        _decoration: &ZxdgToplevelDecorationV1,
        event: zxdg_toplevel_decoration_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let zxdg_toplevel_decoration_v1::Event::Configure {
            mode: WEnum::Value(mode),
        } = event
        {
            let mode = match mode {
                zxdg_toplevel_decoration_v1::Mode::ServerSide => DecorationMode::ServerSide,
                _ => DecorationMode::ClientSide,
            };
            state.window.decoration_configure(mode);
        }
    }
}

impl Dispatch<WpPresentation, ()> for SessionState {
    fn event(
        state: &mut Self,
        _presentation: &WpPresentation,
        event: wp_presentation::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wp_presentation::Event::ClockId { clk_id } = event {
            state.pacer.set_clock_id(clk_id);
        }
    }
}

impl Dispatch<WpPresentationFeedback, ()> for SessionState {
    fn event(
        state: &mut Self,
        _feedback: &WpPresentationFeedback,
        event: wp_presentation_feedback::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wp_presentation_feedback::Event::Presented {
                tv_sec_hi,
                tv_sec_lo,
                tv_nsec,
                refresh,
                seq_hi,
                seq_lo,
                ..
            } => {
                let tv_sec = ((tv_sec_hi as u64) << 32) | tv_sec_lo as u64;
                let seq = ((seq_hi as u64) << 32) | seq_lo as u64;
                state.pacer.presented(tv_sec, tv_nsec, refresh, seq);
            }
            wp_presentation_feedback::Event::Discarded => trace!("presentation discarded"),
            _ => {}
        }
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for SessionState {
    fn event(
        state: &mut Self,
        _dmabuf: &ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwp_linux_dmabuf_v1::Event::Format { format } => {
                state.catalog.record_implicit(format);
            }
            zwp_linux_dmabuf_v1::Event::Modifier {
                format,
                modifier_hi,
                modifier_lo,
            } => {
                let modifier = ((modifier_hi as u64) << 32) | modifier_lo as u64;
                state.catalog.record_modifier(format, modifier);
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwpLinuxDmabufFeedbackV1, ()> for SessionState {
    fn event(
        state: &mut Self,
        _feedback: &ZwpLinuxDmabufFeedbackV1,
        event: zwp_linux_dmabuf_feedback_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwp_linux_dmabuf_feedback_v1::Event::FormatTable { fd, size } => {
                if let Err(err) = state.catalog.load_table(fd, size) {
                    error!("failed to map the dmabuf format table: {err}");
                }
            }
            zwp_linux_dmabuf_feedback_v1::Event::TrancheFormats { indices } => {
                state.catalog.add_tranche_indices(&indices);
            }
            zwp_linux_dmabuf_feedback_v1::Event::Done => {
                state.catalog.commit_feedback();
                debug!(formats = state.catalog.len(), "dmabuf feedback done");
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwpLinuxBufferParamsV1, ()> for SessionState {
    fn event(
        _state: &mut Self,
        _params: &ZwpLinuxBufferParamsV1,
        event: zwp_linux_buffer_params_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let zwp_linux_buffer_params_v1::Event::Failed = event {
            warn!("compositor failed to import a dmabuf");
        }
    }

    event_created_child!(SessionState, ZwpLinuxBufferParamsV1, [
        zwp_linux_buffer_params_v1::EVT_CREATED_OPCODE => (WlBuffer, ())
    ]);
}

impl Dispatch<WlBuffer, ()> for SessionState {
    fn event(
        _state: &mut Self,
        _buffer: &WlBuffer,
        event: wl_buffer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            trace!("buffer released");
        }
    }
}

impl SeatHandler for SessionState {
    fn seat_state(&mut self) -> &mut SeatState {
        &mut self.seat_state
    }

    fn new_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, seat: WlSeat) {
        if self.seat.is_none() {
            self.seat = Some(seat);
        }
    }

    fn new_capability(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        seat: WlSeat,
        capability: Capability,
    ) {
        if self.seat.is_none() {
            self.seat = Some(seat.clone());
        }
        match capability {
            Capability::Pointer if self.pointer.is_none() => {
                match self.seat_state.get_pointer(qh, &seat) {
                    Ok(pointer) => self.pointer = Some(pointer),
                    Err(err) => warn!("Failed to create pointer: {err}"),
                }
            }
            Capability::Keyboard if self.keyboard.is_none() => {
                self.keyboard = Some(seat.get_keyboard(qh, ()));
            }
            Capability::Touch if self.touch.is_none() => {
                match self.seat_state.get_touch(qh, &seat) {
                    Ok(touch) => self.touch = Some(touch),
                    Err(err) => warn!("Failed to create touch: {err}"),
                }
            }
            _ => {}
        }
    }

    fn remove_capability(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _seat: WlSeat,
        capability: Capability,
    ) {
        match capability {
            Capability::Pointer => {
                if let Some(pointer) = self.pointer.take() {
                    pointer.release();
                }
            }
            Capability::Keyboard => {
                if let Some(keyboard) = self.keyboard.take() {
                    keyboard.release();
                    self.window.keyboard_focus(false);
                }
            }
            Capability::Touch => {
                if let Some(touch) = self.touch.take() {
                    touch.release();
                }
            }
            _ => {}
        }
    }

    fn remove_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, seat: WlSeat) {
        if self.seat.as_ref() == Some(&seat) {
            self.seat = None;
        }
    }
}

impl PointerHandler for SessionState {
    fn pointer_frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _pointer: &WlPointer,
        events: &[PointerEvent],
    ) {
        for event in events {
            if event.surface != self.surface {
                continue;
            }
            if let PointerEventKind::Press {
                button: BTN_LEFT,
                serial,
                ..
            } = event.kind
            {
                let (x, y) = event.position;
                if let Some(request) = self.window.pointer_pressed(x, y) {
                    self.send_shell_request(request, Some(serial));
                }
            }
        }
    }
}

impl TouchHandler for SessionState {
    fn down(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        serial: u32,
        _time: u32,
        _surface: WlSurface,
        _id: i32,
        position: (f64, f64),
    ) {
        let request = self.window.touch_down(position.0, position.1);
        self.send_shell_request(request, Some(serial));
    }

    fn up(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _serial: u32,
        _time: u32,
        _id: i32,
    ) {
    }

    fn motion(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _time: u32,
        _id: i32,
        _position: (f64, f64),
    ) {
    }

    fn shape(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _id: i32,
        _major: f64,
        _minor: f64,
    ) {
    }

    fn orientation(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _id: i32,
        _orientation: f64,
    ) {
    }

    fn cancel(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _touch: &WlTouch) {}
}

impl Dispatch<WlKeyboard, ()> for SessionState {
    fn event(
        state: &mut Self,
        _keyboard: &WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_keyboard::Event::Enter { surface, .. } if surface == state.surface => {
                state.window.keyboard_focus(true);
            }
            wl_keyboard::Event::Leave { surface, .. } if surface == state.surface => {
                state.window.keyboard_focus(false);
            }
            _ => {}
        }
    }
}

delegate_noop!(SessionState: ignore ZxdgDecorationManagerV1);
delegate_noop!(SessionState: ignore WlSubcompositor);
delegate_noop!(SessionState: ignore WlSubsurface);
delegate_noop!(SessionState: ignore WpViewporter);
delegate_noop!(SessionState: ignore WpViewport);
delegate_noop!(SessionState: ignore WlShmPool);
delegate_noop!(SessionState: ignore ZwpIdleInhibitManagerV1);
delegate_noop!(SessionState: ignore ZwpIdleInhibitorV1);

delegate_compositor!(SessionState);
delegate_output!(SessionState);
delegate_shm!(SessionState);
delegate_registry!(SessionState);
delegate_seat!(SessionState);
delegate_pointer!(SessionState);
delegate_touch!(SessionState);

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_states(states: &[u32]) -> Vec<u8> {
        states.iter().flat_map(|state| state.to_ne_bytes()).collect()
    }

    #[test]
    fn toplevel_states_are_decoded() {
        let states = parse_toplevel_states(&raw_states(&[2, 4]));
        assert!(states.is_fullscreen());
        assert!(states.contains(ToplevelStates::ACTIVATED));
        assert!(!states.is_maximized());
    }

    #[test]
    fn tiling_counts_as_maximized() {
        let states = parse_toplevel_states(&raw_states(&[5, 8]));
        assert!(states.is_maximized());
    }

    #[test]
    fn unknown_states_and_trailing_bytes_are_ignored() {
        let mut raw = raw_states(&[1, 1000]);
        raw.push(0xff);
        assert_eq!(parse_toplevel_states(&raw), ToplevelStates::MAXIMIZED);
    }
}
