//! Framework configuration.
//!
//! Every tunable that governs the action framework lives here and is passed
//! in explicitly at construction. There are no ambient globals or console
//! variables; a deployment overrides values through a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AxleError, Result};

/// Top-level configuration for the action framework.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub action: ActionConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub docking: DockingConfig,
    #[serde(default)]
    pub drive: DriveConfig,
}

impl FrameworkConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FrameworkConfig =
            toml::from_str(&content).map_err(|e| AxleError::Config(e.to_string()))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    /// or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AxleError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// Engine tick loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ticks per second of the control loop.
    pub tick_hz: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { tick_hz: 30.0 }
    }
}

/// Defaults applied to every action unless the action overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Seconds before the framework force-fails a running action.
    pub default_timeout_s: f32,
    /// Retries granted when a retry-category failure occurs. Zero means a
    /// leaf action never retries itself.
    pub default_num_retries: u8,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            default_timeout_s: 30.0,
            default_num_retries: 0,
        }
    }
}

/// Point-turn kinematics and timeout sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Default max angular speed, rad/s.
    pub max_speed_rad_per_s: f32,
    /// Default angular acceleration, rad/s^2.
    pub accel_rad_per_s2: f32,
    /// Default completion tolerance, radians.
    pub angle_tolerance_rad: f32,
    /// Relaxed tolerance used while the robot is held in a palm, radians.
    pub held_in_palm_tolerance_rad: f32,
    /// Multiplier applied to the closed-form profile duration when sizing a
    /// recomputed timeout.
    pub timeout_factor: f32,
    /// Floor for any recomputed timeout, seconds.
    pub min_timeout_s: f32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_speed_rad_per_s: 2.0,
            accel_rad_per_s2: 10.0,
            angle_tolerance_rad: 2f32.to_radians(),
            held_in_palm_tolerance_rad: 10f32.to_radians(),
            timeout_factor: 2.5,
            min_timeout_s: 2.0,
        }
    }
}

/// Docking geometry and verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockingConfig {
    /// Angle tolerance for the pre-action pose proximity check, radians.
    pub pre_action_angle_tolerance_rad: f32,
    /// Scale applied to the Y distance threshold to get the X threshold
    /// (radial slop matters more than tangential near a marker).
    pub x_threshold_scalar: f32,
    /// Distance under which two candidate predock poses count as the same,
    /// mm.
    pub same_pose_dist_thresh_mm: f32,
    /// Angle under which two candidate predock poses count as the same,
    /// radians.
    pub same_pose_angle_thresh_rad: f32,
    /// Mandatory settle delay between physical completion and
    /// verification, seconds.
    pub settle_delay_s: f32,
    /// Docking speed, mm/s.
    pub dock_speed_mmps: f32,
    /// Docking acceleration / deceleration, mm/s^2.
    pub dock_accel_mmps2: f32,
    pub dock_decel_mmps2: f32,
    /// Low-level docking retries granted to the actuator.
    pub num_docking_retries: u8,
    /// Most negative placement X offset allowed before the robot would
    /// plow through the object, mm.
    pub max_negative_x_offset_mm: f32,
    /// Tolerance for snapping the robot/object relative heading to a 90
    /// degree bucket when transforming placement offsets, radians.
    pub placement_snap_tolerance_rad: f32,
    /// Wait before giving up on the lift load report, seconds.
    pub lift_load_timeout_s: f32,
    /// How long the object may keep moving after the robot stops before
    /// pickup is presumed hijacked, seconds.
    pub max_object_moving_after_stop_s: f32,
    /// How long before verification the object must have moved for pickup
    /// to count, seconds.
    pub max_object_not_moved_before_stop_s: f32,
}

impl Default for DockingConfig {
    fn default() -> Self {
        Self {
            pre_action_angle_tolerance_rad: 10f32.to_radians(),
            x_threshold_scalar: 1.5,
            same_pose_dist_thresh_mm: 100.0,
            same_pose_angle_thresh_rad: 30f32.to_radians(),
            settle_delay_s: 0.25,
            dock_speed_mmps: 60.0,
            dock_accel_mmps2: 200.0,
            dock_decel_mmps2: 200.0,
            num_docking_retries: 2,
            max_negative_x_offset_mm: 16.0,
            placement_snap_tolerance_rad: 15f32.to_radians(),
            lift_load_timeout_s: 1.0,
            max_object_moving_after_stop_s: 2.0,
            max_object_not_moved_before_stop_s: 3.0,
        }
    }
}

/// Path-following settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Overall drive-to-pose action timeout, seconds.
    pub drive_timeout_s: f32,
    /// Hard limit on planner computation before aborting, seconds.
    pub max_planning_time_s: f32,
    /// Per-axis goal distance threshold, mm.
    pub goal_dist_threshold_mm: f32,
    /// Goal heading threshold, radians.
    pub goal_angle_threshold_rad: f32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            drive_timeout_s: 30.0,
            max_planning_time_s: 10.0,
            goal_dist_threshold_mm: 5.0,
            goal_angle_threshold_rad: 5f32.to_radians(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FrameworkConfig::default();
        assert!((config.engine.tick_hz - 30.0).abs() < f32::EPSILON);
        assert!((config.action.default_timeout_s - 30.0).abs() < f32::EPSILON);
        assert_eq!(config.action.default_num_retries, 0);
        assert!(config.docking.pre_action_angle_tolerance_rad > 0.0);
        assert!(config.docking.x_threshold_scalar > 1.0);
        assert!((config.drive.goal_dist_threshold_mm - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = FrameworkConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let rt: FrameworkConfig = toml::from_str(&toml_str).unwrap();
        assert!((config.turn.max_speed_rad_per_s - rt.turn.max_speed_rad_per_s).abs() < 1e-6);
        assert_eq!(
            config.docking.num_docking_retries,
            rt.docking.num_docking_retries
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [turn]
            max_speed_rad_per_s = 1.5
        "#;
        let config: FrameworkConfig = toml::from_str(toml_str).unwrap();
        assert!((config.turn.max_speed_rad_per_s - 1.5).abs() < 1e-6);
        // Untouched sections keep their defaults.
        assert!((config.turn.accel_rad_per_s2 - 10.0).abs() < 1e-6);
        assert!((config.engine.tick_hz - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axle.toml");

        let mut config = FrameworkConfig::default();
        config.drive.max_planning_time_s = 7.5;
        config.save(&path).unwrap();

        let loaded = FrameworkConfig::load(&path).unwrap();
        assert!((loaded.drive.max_planning_time_s - 7.5).abs() < 1e-6);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = FrameworkConfig::load_or_default(Path::new("/nonexistent/axle.toml"));
        assert!((config.engine.tick_hz - 30.0).abs() < f32::EPSILON);
    }
}
