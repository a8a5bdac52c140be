//! TOML config file loading, validation, and database seeding for rooms and
//! presets.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::Db;
use crate::heater::HeaterConfig;
use crate::preset::{default_presets, Preset, NO_PRESET};
use crate::room::RoomConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub heater: HeaterConfig,
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
    /// `None` when the file has no `[[presets]]` at all.
    #[serde(default)]
    pub presets: Option<Vec<Preset>>,
}

impl Config {
    /// Presets from the file, or Night/Away when none are listed.
    pub fn effective_presets(&self) -> Vec<Preset> {
        self.presets.clone().unwrap_or_else(default_presets)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_heater(&mut errors);
        self.validate_rooms(&mut errors);
        self.validate_presets(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_heater(&self, errors: &mut Vec<String>) {
        if self.heater.entity.trim().is_empty() {
            errors.push("heater: entity is empty".to_string());
        }
    }

    fn validate_rooms(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, r) in self.rooms.iter().enumerate() {
            let ctx = || {
                if r.name.is_empty() {
                    format!("rooms[{i}]")
                } else {
                    format!("room '{}'", r.name)
                }
            };

            if r.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen.insert(&r.name) {
                errors.push(format!("{}: duplicate room name", ctx()));
            }

            if r.temperature_sensor.trim().is_empty() {
                errors.push(format!("{}: temperature_sensor is empty", ctx()));
            }
            if r.humidity_sensor.as_deref().is_some_and(|s| s.trim().is_empty()) {
                errors.push(format!("{}: humidity_sensor is empty", ctx()));
            }
            if r.climate_entity.as_deref().is_some_and(|s| s.trim().is_empty()) {
                errors.push(format!("{}: climate_entity is empty", ctx()));
            }

            if !r.hysteresis.is_finite() || r.hysteresis <= 0.0 {
                errors.push(format!(
                    "{}: hysteresis must be positive, got {}",
                    ctx(),
                    r.hysteresis
                ));
            }
        }
    }

    fn validate_presets(&self, errors: &mut Vec<String>) {
        let Some(presets) = &self.presets else {
            return;
        };
        let rooms: HashSet<&str> = self.rooms.iter().map(|r| r.name.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, p) in presets.iter().enumerate() {
            let ctx = || {
                if p.name.is_empty() {
                    format!("presets[{i}]")
                } else {
                    format!("preset '{}'", p.name)
                }
            };

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if p.name.eq_ignore_ascii_case(NO_PRESET) {
                errors.push(format!("{}: name '{NO_PRESET}' is reserved", ctx()));
            } else if !seen.insert(&p.name) {
                errors.push(format!("{}: duplicate preset name", ctx()));
            }

            if !p.default_temperature.is_finite() {
                errors.push(format!(
                    "{}: default_temperature {} is not a finite number",
                    ctx(),
                    p.default_temperature
                ));
            }

            for (room, t) in &p.overrides {
                if !rooms.contains(room.as_str()) {
                    errors.push(format!(
                        "{}: override for '{room}' does not match any defined room",
                        ctx()
                    ));
                }
                if !t.is_finite() {
                    errors.push(format!(
                        "{}: override for '{room}' ({t}) is not a finite number",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed the database from the file. Rooms and presets are written only into
/// empty tables (the Night/Away defaults stand in for an absent preset
/// list), so runtime add/edit/remove survives a restart.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let rooms: &[RoomConfig] = if db.count_rooms().await? == 0 {
        &config.rooms
    } else {
        &[]
    };
    for r in rooms {
        db.upsert_room(r)
            .await
            .with_context(|| format!("failed to upsert room '{}'", r.name))?;
    }

    let presets = if db.count_presets().await? == 0 {
        config.effective_presets()
    } else {
        Vec::new()
    };
    for p in &presets {
        db.upsert_preset(p)
            .await
            .with_context(|| format!("failed to upsert preset '{}'", p.name))?;
    }

    tracing::info!(
        rooms = rooms.len(),
        presets = presets.len(),
        heater = %config.heater.entity,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
