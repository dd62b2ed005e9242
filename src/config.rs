//! YAML configuration and hot reload.

use crate::backend::BackendKind;
use crate::capture::CaptureConfig;
use crate::filters::Filter;
use crate::keying::{ChromaKey, KeyColor};
use crate::pipeline::EffectSettings;
use crate::present::OverlayConfig;
use crate::segmentation::SegmentationConfig;
use crate::source::CropRect;
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{error, info, warn};

/// Everything a session reads from its config file.
///
/// Every key is optional. A malformed key color fails the whole parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub crop: CropRect,
    /// Uniform scale applied after cropping
    pub scale: f32,
    /// Mirror horizontally (on by default, like a selfie view)
    pub flip_x: bool,
    pub flip_y: bool,
    pub key: ChromaKey,
    /// Filter stages, applied in order
    pub filters: Vec<Filter>,
    pub overlay: Option<OverlayConfig>,
    /// Left click in the window picks the key color
    pub show_color_dropper: bool,
    /// Window color behind keyed-out pixels, `#RRGGBB`
    pub background: KeyColor,
    /// Delay before reopening a camera whose stream died
    pub reconnect_after_ms: u64,
    pub backend: BackendKind,
    pub segmentation: SegmentationConfig,
    pub camera: CaptureConfig,
}

impl Default for Config {
    fn default() -> Self {
        let effects = EffectSettings::default();
        Self {
            crop: effects.crop,
            scale: effects.scale,
            flip_x: effects.flip_x,
            flip_y: effects.flip_y,
            key: effects.key,
            filters: effects.filters,
            overlay: None,
            show_color_dropper: false,
            background: KeyColor { r: 0.0, g: 0.0, b: 0.0 },
            reconnect_after_ms: 3000,
            backend: BackendKind::default(),
            segmentation: SegmentationConfig::default(),
            camera: CaptureConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// The per-frame parameters for the effect pipeline.
    pub fn effect_settings(&self) -> EffectSettings {
        EffectSettings {
            crop: self.crop,
            scale: self.scale,
            flip_x: self.flip_x,
            flip_y: self.flip_y,
            key: self.key,
            filters: self.filters.clone(),
        }
    }
}

/// Command-line values that take precedence over the config file, including
/// across hot reloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub device_index: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub backend: Option<BackendKind>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(device_index) = self.device_index {
            config.camera.device_index = device_index;
        }
        if let Some(width) = self.width {
            config.camera.width = width;
        }
        if let Some(height) = self.height {
            config.camera.height = height;
        }
        if let Some(fps) = self.fps {
            config.camera.fps = fps;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
    }
}

/// Manages configuration file watching and reloading.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<std::result::Result<Event, notify::Error>>,
    current_config: Config,
}

impl ConfigWatcher {
    /// Starts watching `path`. `current` is the config already loaded from it.
    pub fn new(path: PathBuf, current: Config) -> Option<Self> {
        let (tx, rx) = channel();

        match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(mut watcher) => {
                if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                    warn!("Failed to watch config file {:?}: {}", path, e);
                    return None;
                }
                info!("Watching config file {:?} for changes", path);
                Some(Self {
                    path,
                    _watcher: watcher,
                    rx,
                    current_config: current,
                })
            }
            Err(e) => {
                warn!("Failed to create config watcher: {}", e);
                None
            }
        }
    }

    /// The config as last loaded from the file.
    pub fn current(&self) -> &Config {
        &self.current_config
    }

    /// Reloads if the watcher reported a change to the file.
    pub fn check_for_changes(&mut self) -> Option<(Config, Config)> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            if let Ok(event) = res {
                if matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                    needs_reload = true;
                }
            }
        }
        if !needs_reload {
            return None;
        }

        info!("Config file changed, reloading...");
        self.reload()
    }

    /// Returns `(old, new)` if the file changed and still parses. A file that
    /// no longer parses is logged and the previous config stays in effect.
    pub fn reload(&mut self) -> Option<(Config, Config)> {
        match Config::load(&self.path) {
            Ok(new_config) if new_config == self.current_config => None,
            Ok(new_config) => {
                let old = std::mem::replace(&mut self.current_config, new_config.clone());
                Some((old, new_config))
            }
            Err(e) => {
                error!("Keeping previous config: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.flip_x);
        assert_eq!(config.key.color, KeyColor::GREEN);
        assert_eq!(config.camera.width, 1280);
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r##"
crop: { left: 10, right: 20, top: 0, bottom: 5 }
scale: 0.5
flip_x: false
key:
  color: "#00b140"
  similarity: 0.3
  smoothness: 0.1
  spill: 0.2
filters:
  - brightness_contrast: { brightness: 0.1, contrast: 0.2 }
  - sepia: 0.4
  - unsharp_mask: { radius: 3, strength: 1.5 }
overlay:
  path: art/frame.png
  x: 12
  y: -4
show_color_dropper: true
background: "#202020"
reconnect_after_ms: 500
backend: cpu
segmentation:
  model_path: models/modnet.onnx
camera:
  device_index: 1
  fps: 60
"##;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.crop,
            CropRect {
                left: 10,
                right: 20,
                top: 0,
                bottom: 5
            }
        );
        assert_eq!(config.key.color.to_hex(), "#00b140");
        assert_eq!(config.filters.len(), 3);
        assert_eq!(config.filters[1], Filter::Sepia(0.4));
        assert_eq!(config.overlay.as_ref().unwrap().y, -4);
        assert_eq!(config.backend, BackendKind::Cpu);
        assert_eq!(config.camera.device_index, 1);
        assert_eq!(config.camera.height, 720);
        assert_eq!(
            config.segmentation.model_path,
            Some(PathBuf::from("models/modnet.onnx"))
        );

        let effects = config.effect_settings();
        assert!(!effects.flip_x);
        assert_eq!(effects.scale, 0.5);
        assert_eq!(effects.filters, config.filters);
    }

    #[test]
    fn test_malformed_key_color_fails_parse() {
        let err = Config::from_yaml("key: { color: \"#12345\" }").unwrap_err();
        assert!(format!("{:#}", err).contains("Malformed key color"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::from_yaml("sclae: 2.0").is_err());
    }

    /// A config file path unique to this test process.
    fn temp_config_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chromacam-{}-{}.yaml", name, std::process::id()))
    }

    #[test]
    fn test_malformed_reload_keeps_previous_config() {
        let path = temp_config_path("reload");
        fs::write(&path, "scale: 0.5\n").unwrap();
        let loaded = Config::load(&path).unwrap();
        let mut watcher = ConfigWatcher::new(path.clone(), loaded.clone()).unwrap();

        fs::write(&path, "key: { color: \"#zzzzzz\" }\n").unwrap();
        assert!(watcher.reload().is_none());
        assert_eq!(watcher.current(), &loaded);

        // Unchanged content is not reported.
        fs::write(&path, "scale: 0.5\n").unwrap();
        assert!(watcher.reload().is_none());

        fs::write(&path, "scale: 0.25\n").unwrap();
        let (old, new) = watcher.reload().unwrap();
        assert_eq!(old.scale, 0.5);
        assert_eq!(new.scale, 0.25);
        assert_eq!(watcher.current(), &new);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = Config::from_yaml("camera: { device_index: 0, fps: 15 }\nbackend: gpu\n").unwrap();
        let overrides = ConfigOverrides {
            device_index: Some(2),
            backend: Some(BackendKind::Cpu),
            ..ConfigOverrides::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.camera.device_index, 2);
        assert_eq!(config.camera.fps, 15);
        assert_eq!(config.backend, BackendKind::Cpu);

        let before = config.clone();
        ConfigOverrides::default().apply(&mut config);
        assert_eq!(config, before);
    }

    #[test]
    fn test_config_round_trips_through_yaml() {
        let mut config = Config::default();
        config.filters = vec![
            Filter::TriangleBlur(2.0),
            Filter::HueSaturation {
                hue: 0.25,
                saturation: -0.5,
            },
        ];
        config.background = KeyColor::from_hex("#102030").unwrap();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }
}
