use std::time::{Duration, Instant};

use anyhow::Context;
use dmabuf_wayland::{Config, FourCc, OutputSession, VoEvents};

static USAGE: &[&str] = &[
    "--probe : Print the dmabuf formats and outputs the compositor offers, then exit.",
    "--window : Open the video window and run the event loop until it is closed (default).",
];

/// Video size used for the window when no decoder is attached.
const PLACEHOLDER_SIZE: (i32, i32) = (1280, 720);

#[cfg(feature = "profile-with-tracy")]
fn start_profiler() {
    profiling::tracy_client::Client::start();
}

#[cfg(not(feature = "profile-with-tracy"))]
fn start_profiler() {}

fn main() -> anyhow::Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .compact()
            .init();
    }

    start_profiler();
    profiling::register_thread!("Main Thread");

    #[cfg(feature = "profile-with-puffin")]
    let _server = puffin_http::Server::new(&format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT));
    #[cfg(feature = "profile-with-puffin")]
    profiling::puffin::set_scopes_on(true);

    let config = Config::with(|config| config.clone());

    let arg = std::env::args().nth(1);
    match arg.as_deref() {
        Some("--probe") => probe(&config),
        Some("--window") | None => run_window(&config),
        Some(other) => {
            tracing::error!("Unknown option: {}", other);
            println!("USAGE: dmabuf-wayland [OPTION]");
            println!();
            println!("Possible options are:");
            for line in USAGE {
                println!("\t{line}");
            }
            Ok(())
        }
    }
}

fn probe(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Probing compositor formats and outputs");
    let session = OutputSession::connect(config).context("failed to open the wayland session")?;

    println!("dmabuf negotiation: {:?}", session.catalog().negotiation());
    for entry in session.formats() {
        println!("  {} modifier {:#018x}", FourCc(entry.format), entry.modifier);
    }

    println!("outputs:");
    for (index, output) in session.outputs().iter().enumerate() {
        let (width, height) = output.geometry.size();
        println!(
            "  [{index}] {} ({} {}) {width}x{height}@{:.3}Hz scale {}",
            output.display_name(),
            output.make,
            output.model,
            output.refresh_hz,
            output.scale
        );
    }
    Ok(())
}

fn run_window(config: &Config) -> anyhow::Result<()> {
    let mut session =
        OutputSession::connect(config).context("failed to open the wayland session")?;
    let (width, height) = PLACEHOLDER_SIZE;
    session.reconfig(width, height)?;

    while !session.close_requested() {
        let events = session.check_events()?;
        if events.contains(VoEvents::DPI) {
            tracing::debug!(scale = ?session.hidpi_scale(), "output scale changed");
        }
        if events.contains(VoEvents::WIN_STATE) {
            tracing::debug!(displays = ?session.display_names(), fps = ?session.display_fps(), "window state changed");
        }
        if events.contains(VoEvents::FOCUS) {
            tracing::debug!(focused = session.focused(), "focus changed");
        }
        session.wait_events(Instant::now() + Duration::from_secs(1))?;
    }

    tracing::info!("Window closed");
    Ok(())
}
