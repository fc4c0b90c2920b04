pub mod capture;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod source;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::frame::{
    AspectPolicy, CaptureTick, FormatDescriptor, FrameBuffer, Orientation, PixelFormat,
};
pub use diagnostics::{DiagnosticEvent, Diagnostics, DiagnosticsConfig};
pub use engine::{EngineConfig, EngineStats, PassReason, Substitution, SubstitutionEngine};
pub use error::{Result, VcamError};
pub use network::quality::{QualityPolicy, QualityPreset};
pub use network::{ConnectionState, ConnectionStats, NetworkConfig, NetworkStreamSource};
pub use pipeline::pool::PoolConfig;
pub use source::{FrameSourceAdapter, FrameSourceState, SourceConfig, SourceKind};

/// Environment variables override file values: `VCAM__NETWORK__ROOM_ID=...`
pub const ENV_PREFIX: &str = "VCAM";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub source: SourceConfig,
    pub pool: PoolConfig,
    pub network: NetworkConfig,
    pub quality: QualityPolicy,
    pub diagnostics: DiagnosticsConfig,
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `VCAM__*`
    /// environment overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, what: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(VcamError::Config(what.to_string()))
            }
        }
        let unit = |x: f64| x > 0.0 && x <= 1.0;

        let engine = &self.engine;
        check(unit(engine.processing_ema_alpha), "engine.processing_ema_alpha must be in (0, 1]")?;
        if let Some((w, h)) = engine.target_resolution {
            check(w > 0 && h > 0, "engine.target_resolution must be non-zero")?;
        }

        let source = &self.source;
        check(source.fps.is_finite() && source.fps > 0.0, "source.fps must be positive")?;
        check(source.read_ahead > 0, "source.read_ahead must be at least 1")?;
        if matches!(source.kind, SourceKind::Still | SourceKind::Clip) {
            check(source.path.is_some(), "source.path is required for still and clip sources")?;
        }

        check(self.pool.per_key_cap > 0, "pool.per_key_cap must be at least 1")?;
        check(self.pool.total_cap > 0, "pool.total_cap must be at least 1")?;

        let network = &self.network;
        check(
            network.preferred_width > 0 && network.preferred_height > 0,
            "network preferred resolution must be non-zero",
        )?;
        check(network.preferred_fps > 0.0, "network.preferred_fps must be positive")?;
        check(
            network.stale_frame_timeout_ms > 0,
            "network.stale_frame_timeout_ms must be positive",
        )?;
        check(unit(network.fps_ema_alpha as f64), "network.fps_ema_alpha must be in (0, 1]")?;

        let quality = &self.quality;
        check(
            quality.downgrade_ratio > 0.0 && quality.downgrade_ratio < quality.upgrade_ratio,
            "quality.downgrade_ratio must be positive and below upgrade_ratio",
        )?;
        check(
            quality.downgrade_windows > 0 && quality.upgrade_windows > 0,
            "quality windows must be at least 1",
        )?;
        check(quality.window_ms > 0, "quality.window_ms must be positive")?;

        check(
            self.diagnostics.channel_capacity > 0,
            "diagnostics.channel_capacity must be at least 1",
        )?;
        check(
            self.diagnostics.frame_stats_interval > 0,
            "diagnostics.frame_stats_interval must be at least 1",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ClipEndPolicy;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = Config::from_toml_str(
            r#"
            [engine]
            mirror_output = true
            target_resolution = [1280, 720]

            [source]
            kind = "clip"
            path = "/srv/clips/intro"
            fps = 24.0
            end_policy = "hold"

            [network]
            room_id = "studio-b"
            initial_preset = "medium"

            [quality]
            downgrade_windows = 5
            "#,
        )
        .unwrap();

        assert!(config.engine.mirror_output);
        assert_eq!(config.engine.target_resolution, Some((1280, 720)));
        assert_eq!(config.source.kind, SourceKind::Clip);
        assert_eq!(config.source.end_policy, ClipEndPolicy::Hold);
        assert_eq!(config.network.room_id, "studio-b");
        assert_eq!(config.network.initial_preset, QualityPreset::Medium);
        assert_eq!(config.quality.downgrade_windows, 5);
        assert_eq!(config.quality.upgrade_windows, 10);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("[pool]\ntotal_cap = 0"),
            Err(VcamError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[source]\nkind = \"still\""),
            Err(VcamError::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vcam.toml");
        std::fs::write(&path, "[network]\npreferred_fps = 15.0\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.network.preferred_fps, 15.0);
    }
}
