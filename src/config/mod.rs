use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use toml::map::Entry;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wayland: WaylandConfig,
    pub window: WindowConfig,
    pub presentation: PresentationConfig,
    pub pool: PoolConfig,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaylandConfig {
    /// Cap the initial window size to the compositor's configure bounds.
    pub configure_bounds: bool,
    /// Keep rendering while the surface is hidden and never block on frame callbacks.
    pub disable_vsync: bool,
    pub edge_pixels_pointer: i32,
    pub edge_pixels_touch: i32,
}

impl Default for WaylandConfig {
    fn default() -> Self {
        Self {
            configure_bounds: true,
            disable_vsync: false,
            edge_pixels_pointer: 10,
            edge_pixels_touch: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub fullscreen: bool,
    pub maximized: bool,
    pub minimized: bool,
    pub border: bool,
    pub keepaspect: bool,
    pub keepaspect_window: bool,
    pub hidpi_window_scale: bool,
    pub title: String,
    pub app_id: String,
    /// Explicit window size in pixels, 0 to follow the video size.
    pub width: i32,
    pub height: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_screen_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_screen_name: Option<String>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            fullscreen: false,
            maximized: false,
            minimized: false,
            border: true,
            keepaspect: true,
            keepaspect_window: true,
            hidpi_window_scale: true,
            title: "dmabuf-wayland".to_string(),
            app_id: "dmabuf-wayland".to_string(),
            width: 0,
            height: 0,
            fs_screen_id: None,
            fs_screen_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    /// Fraction of the vblank interval added to the frame callback deadline.
    pub safety_margin: f64,
    pub hidden_after_misses: u32,
    pub fallback_refresh_hz: f64,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            safety_margin: 0.05,
            hidden_after_misses: 2,
            fallback_refresh_hz: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Display cycles cleared after a discontinuity. The compositor may still
    /// hold the previous buffers for a cycle or two; how many depends on its
    /// release timing.
    pub reset_window: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { reset_window: 2 }
    }
}

impl Config {
    pub fn with<R>(f: impl FnOnce(&Config) -> R) -> R {
        let config = CONFIG.get_or_init(Config::load);
        f(config)
    }

    pub fn load() -> Self {
        let mut merged = match toml::Value::try_from(Self::default()) {
            Ok(value) => value,
            Err(err) => {
                warn!("Default config failed to serialize: {err}");
                return Self::default();
            }
        };

        let mut found_any_config = false;

        // Lowest to highest priority
        let candidates = [
            get_system_config_path(),
            get_user_config_path(),
            Some(PathBuf::from("dmabuf_wayland.toml")),
            std::env::var_os("DMABUF_WAYLAND_CONFIG").map(PathBuf::from),
        ];
        for path in candidates.into_iter().flatten() {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            match content.parse::<toml::Value>() {
                Ok(value) => {
                    merge_value(&mut merged, value);
                    found_any_config = true;
                    tracing::info!("Loaded config from {}", path.display());
                }
                Err(err) => warn!("Failed to parse {}: {err}", path.display()),
            }
        }

        if !found_any_config {
            tracing::debug!("No configuration file found, using default config");
        }

        merged.try_into().unwrap_or_else(|err| {
            warn!("Falling back to default config due to invalid overrides: {err}");
            Self::default()
        })
    }
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}

fn get_system_config_path() -> Option<PathBuf> {
    let path = PathBuf::from("/etc/dmabuf-wayland/config.toml");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn get_user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config"))
        })?;

    let path = config_dir.join("dmabuf-wayland").join("config.toml");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.pool.reset_window, 2);
        assert_eq!(config.presentation.hidden_after_misses, 2);
        assert_eq!(config.presentation.safety_margin, 0.05);
        assert_eq!(config.wayland.edge_pixels_pointer, 10);
        assert_eq!(config.wayland.edge_pixels_touch, 32);
        assert!(config.window.keepaspect);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let overrides = r#"
            [window]
            fullscreen = true
            fs_screen_name = "DP-1"
        "#;

        let config: Config = toml::from_str(overrides).expect("Config should deserialize");
        assert!(config.window.fullscreen);
        assert_eq!(config.window.fs_screen_name.as_deref(), Some("DP-1"));
        assert_eq!(config.window.width, 0);
        assert!(!config.wayland.disable_vsync);
    }

    #[test]
    #[serial]
    fn test_get_user_config_path_with_xdg_config_home() {
        let temp_dir = tempfile::tempdir().unwrap();

        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        let config_dir = temp_dir.path().join("dmabuf-wayland");
        fs::create_dir_all(&config_dir).unwrap();
        let config_file = config_dir.join("config.toml");
        fs::write(&config_file, "# test config").unwrap();

        let path = get_user_config_path();
        assert_eq!(path, Some(config_file));

        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        } else {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    #[serial]
    fn test_get_user_config_path_without_file() {
        let temp_dir = tempfile::tempdir().unwrap();

        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        assert!(get_user_config_path().is_none());

        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        } else {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    #[serial]
    fn env_override_file_has_highest_priority() {
        let temp_dir = tempfile::tempdir().unwrap();

        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        let user_dir = temp_dir.path().join("dmabuf-wayland");
        fs::create_dir_all(&user_dir).unwrap();
        fs::write(
            user_dir.join("config.toml"),
            "[pool]\nreset_window = 5\n[window]\ntitle = \"user\"\n",
        )
        .unwrap();

        let override_file = temp_dir.path().join("override.toml");
        fs::write(&override_file, "[pool]\nreset_window = 3\n").unwrap();
        env::set_var("DMABUF_WAYLAND_CONFIG", &override_file);

        let config = Config::load();
        assert_eq!(config.pool.reset_window, 3);
        assert_eq!(config.window.title, "user");

        env::remove_var("DMABUF_WAYLAND_CONFIG");
        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        } else {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    #[serial]
    fn invalid_override_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let override_file = temp_dir.path().join("broken.toml");
        fs::write(&override_file, "[pool]\nreset_window = \"many\"\n").unwrap();
        env::set_var("DMABUF_WAYLAND_CONFIG", &override_file);

        let config = Config::load();
        assert_eq!(config.pool.reset_window, PoolConfig::default().reset_window);

        env::remove_var("DMABUF_WAYLAND_CONFIG");
    }

    #[test]
    fn test_config_merge_priority() {
        let mut base =
            toml::Value::try_from(Config::default()).expect("default config is valid toml");

        let override_toml = r#"
            [presentation]
            safety_margin = 0.1
            [wayland]
            disable_vsync = true
        "#;
        let override_value: toml::Value = override_toml.parse().unwrap();

        merge_value(&mut base, override_value);

        let config: Config = base.try_into().unwrap();
        assert_eq!(config.presentation.safety_margin, 0.1);
        assert_eq!(config.presentation.hidden_after_misses, 2);
        assert!(config.wayland.disable_vsync);
        assert_eq!(config.wayland.edge_pixels_touch, 32);
    }
}
