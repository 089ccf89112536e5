//! Frame pacing against compositor frame callbacks and presentation feedback.
//!
//! After each commit the render path blocks until the compositor signals that
//! it wants a new frame, bounded by one vblank interval plus a safety margin.
//! Surfaces that keep missing that deadline are treated as hidden so that
//! rendering stops until the compositor shows them again.

use std::time::Duration;

use tracing::{debug, trace};

use crate::config::Config;

const CLOCK_MONOTONIC: u32 = 1;
const CLOCK_MONOTONIC_RAW: u32 = 4;

/// Timing of the last presented frames, all times in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VsyncInfo {
    pub vsync_duration: i64,
    pub skipped_vsyncs: i64,
    pub last_queue_display_time: i64,
}

/// Tracks (ust, msc) pairs from `wp_presentation_feedback.presented`.
#[derive(Debug, Default)]
pub struct PresentSync {
    current_ust: i64,
    current_msc: i64,
    last_ust: i64,
    last_msc: i64,
    vsync_duration: i64,
    last_skipped_vsyncs: i64,
    last_queue_display_time: i64,
}

impl PresentSync {
    pub fn update_sync_values(&mut self, ust: i64, msc: i64) {
        self.current_ust = ust;
        self.current_msc = msc;
    }

    /// Called once per flip to fold the latest feedback into the estimate.
    pub fn swap(&mut self) {
        let (ust, msc) = (self.current_ust, self.current_msc);
        self.last_skipped_vsyncs = 0;

        if self.last_ust > 0 && msc > self.last_msc && ust > self.last_ust {
            let msc_passed = msc - self.last_msc;
            self.vsync_duration = (ust - self.last_ust) / msc_passed;
            self.last_skipped_vsyncs = msc_passed - 1;
        }
        if ust > 0 && self.vsync_duration > 0 {
            self.last_queue_display_time = ust + self.vsync_duration;
        }

        self.last_ust = ust;
        self.last_msc = msc;
    }

    pub fn vsync_duration(&self) -> i64 {
        self.vsync_duration
    }

    pub fn info(&self) -> VsyncInfo {
        VsyncInfo {
            vsync_duration: self.vsync_duration,
            skipped_vsyncs: self.last_skipped_vsyncs,
            last_queue_display_time: self.last_queue_display_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacerOptions {
    pub safety_margin: f64,
    pub hidden_after_misses: u32,
    pub fallback_refresh_hz: f64,
    pub disable_vsync: bool,
}

impl PacerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            safety_margin: config.presentation.safety_margin,
            hidden_after_misses: config.presentation.hidden_after_misses,
            fallback_refresh_hz: config.presentation.fallback_refresh_hz,
            disable_vsync: config.wayland.disable_vsync,
        }
    }
}

impl Default for PacerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug)]
pub struct FramePacer {
    opts: PacerOptions,
    frame_wait: bool,
    hidden: bool,
    timeout_count: u32,
    use_present: bool,
    refresh_interval: i64,
    present: PresentSync,
}

impl FramePacer {
    pub fn new(opts: PacerOptions) -> Self {
        Self {
            opts,
            frame_wait: false,
            hidden: false,
            timeout_count: 0,
            use_present: false,
            refresh_interval: 0,
            present: PresentSync::default(),
        }
    }

    pub fn options(&self) -> &PacerOptions {
        &self.opts
    }

    /// `wp_presentation.clock_id`. Only monotonic clocks are comparable with ours.
    pub fn set_clock_id(&mut self, clock_id: u32) {
        self.use_present = matches!(clock_id, CLOCK_MONOTONIC | CLOCK_MONOTONIC_RAW);
        debug!(clock_id, use_present = self.use_present, "presentation clock");
    }

    pub fn uses_presentation(&self) -> bool {
        self.use_present
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn is_waiting(&self) -> bool {
        self.frame_wait
    }

    pub fn misses(&self) -> u32 {
        self.timeout_count
    }

    /// Hidden surfaces only count as invisible while vsync is enforced.
    pub fn is_visible(&self) -> bool {
        !self.hidden || self.opts.disable_vsync
    }

    /// Arms the frame wait and reports whether this frame should be rendered.
    pub fn check_visible(&mut self) -> bool {
        let render = self.is_visible();
        self.frame_wait = true;
        render
    }

    /// `wl_callback.done` for the surface frame callback.
    pub fn frame_done(&mut self) {
        self.frame_wait = false;
        self.hidden = false;
    }

    pub fn presented(&mut self, tv_sec: u64, tv_nsec: u32, refresh_nsec: u32, seq: u64) {
        if !self.use_present {
            return;
        }
        self.refresh_interval = refresh_nsec as i64 / 1000;
        let ust = tv_sec as i64 * 1_000_000 + tv_nsec as i64 / 1000;
        let msc = seq as i64;
        trace!(ust, msc, refresh_interval = self.refresh_interval, "frame presented");
        self.present.update_sync_values(ust, msc);
    }

    pub fn swap(&mut self) {
        if self.use_present {
            self.present.swap();
        }
    }

    pub fn vsync_info(&self) -> Option<VsyncInfo> {
        self.use_present.then(|| self.present.info())
    }

    /// Best known vblank interval in microseconds.
    pub fn vblank_interval_us(&self, output_refresh_hz: Option<f64>) -> i64 {
        let mut vblank_time = 0;
        if self.use_present {
            vblank_time = self.present.vsync_duration();
        }
        if vblank_time <= 0 && self.refresh_interval > 0 {
            vblank_time = self.refresh_interval;
        }
        if vblank_time <= 0 {
            if let Some(hz) = output_refresh_hz.filter(|hz| *hz > 0.0) {
                vblank_time = (1e6 / hz) as i64;
            }
        }
        if vblank_time <= 0 {
            vblank_time = (1e6 / self.opts.fallback_refresh_hz.max(1.0)) as i64;
        }
        vblank_time
    }

    /// How long to wait for the frame callback after a commit.
    pub fn frame_deadline(&self, output_refresh_hz: Option<f64>) -> Duration {
        let vblank_time = self.vblank_interval_us(output_refresh_hz) as f64;
        let wait = vblank_time + self.opts.safety_margin * vblank_time;
        Duration::from_micros(wait.max(0.0) as u64)
    }

    /// Books the result of a wait: consecutive misses hide the surface.
    pub fn finish_wait(&mut self) {
        if !self.frame_wait {
            self.timeout_count = 0;
            return;
        }
        self.timeout_count = self.timeout_count.saturating_add(1);
        if self.timeout_count >= self.opts.hidden_after_misses && !self.hidden {
            debug!(misses = self.timeout_count, "no frame callbacks, surface is hidden");
            self.hidden = true;
        }
    }

    /// A resize makes the surface visible again until proven otherwise.
    pub fn reset_visibility(&mut self) {
        self.frame_wait = false;
        self.timeout_count = 0;
        self.hidden = false;
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new(PacerOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vblank_preference_order() {
        let mut pacer = FramePacer::default();
        assert_eq!(pacer.vblank_interval_us(None), 16_666);
        assert_eq!(pacer.vblank_interval_us(Some(144.0)), 6_944);

        pacer.set_clock_id(CLOCK_MONOTONIC);
        pacer.presented(10, 0, 8_333_333, 100);
        assert_eq!(pacer.vblank_interval_us(Some(144.0)), 8_333);

        pacer.swap();
        pacer.presented(10, 20_000_000, 8_333_333, 102);
        pacer.swap();
        assert_eq!(pacer.vblank_interval_us(Some(144.0)), 10_000);
    }

    #[test]
    fn deadline_adds_safety_margin() {
        let pacer = FramePacer::default();
        assert_eq!(pacer.frame_deadline(Some(50.0)), Duration::from_micros(21_000));
    }

    #[test]
    fn non_monotonic_clock_ignores_feedback() {
        let mut pacer = FramePacer::default();
        pacer.set_clock_id(0);
        pacer.presented(10, 0, 8_333_333, 100);
        assert!(!pacer.uses_presentation());
        assert!(pacer.vsync_info().is_none());
        assert_eq!(pacer.vblank_interval_us(None), 16_666);
        pacer.set_clock_id(CLOCK_MONOTONIC_RAW);
        assert!(pacer.uses_presentation());
    }

    #[test]
    fn two_consecutive_misses_hide_the_surface() {
        let mut pacer = FramePacer::default();
        assert!(pacer.check_visible());
        pacer.finish_wait();
        assert!(!pacer.is_hidden());

        assert!(pacer.check_visible());
        pacer.finish_wait();
        assert!(pacer.is_hidden());
        assert!(!pacer.check_visible());
    }

    #[test]
    fn a_frame_callback_resets_the_miss_counter() {
        let mut pacer = FramePacer::default();
        pacer.check_visible();
        pacer.finish_wait();
        assert_eq!(pacer.misses(), 1);

        pacer.check_visible();
        pacer.frame_done();
        pacer.finish_wait();
        assert_eq!(pacer.misses(), 0);

        pacer.check_visible();
        pacer.finish_wait();
        assert!(!pacer.is_hidden());
    }

    #[test]
    fn frame_callback_unhides() {
        let mut pacer = FramePacer::default();
        for _ in 0..2 {
            pacer.check_visible();
            pacer.finish_wait();
        }
        assert!(pacer.is_hidden());
        pacer.frame_done();
        assert!(!pacer.is_hidden());
        assert!(!pacer.is_waiting());
    }

    #[test]
    fn disable_vsync_keeps_rendering_while_hidden() {
        let mut pacer = FramePacer::new(PacerOptions {
            disable_vsync: true,
            ..PacerOptions::default()
        });
        for _ in 0..3 {
            pacer.check_visible();
            pacer.finish_wait();
        }
        assert!(pacer.is_hidden());
        assert!(pacer.is_visible());
        assert!(pacer.check_visible());
    }

    #[test]
    fn hidden_surface_is_invisible_with_vsync() {
        let mut pacer = FramePacer::default();
        assert!(pacer.is_visible());
        for _ in 0..2 {
            pacer.check_visible();
            pacer.finish_wait();
        }
        assert!(!pacer.is_visible());
        pacer.reset_visibility();
        assert!(pacer.is_visible());
        assert!(!pacer.is_waiting());
    }

    #[test]
    fn present_sync_counts_skipped_vsyncs() {
        let mut sync = PresentSync::default();
        sync.update_sync_values(1_000_000, 60);
        sync.swap();
        sync.update_sync_values(1_050_000, 63);
        sync.swap();
        let info = sync.info();
        assert_eq!(info.vsync_duration, 16_666);
        assert_eq!(info.skipped_vsyncs, 2);
        assert_eq!(info.last_queue_display_time, 1_066_666);
    }
}
