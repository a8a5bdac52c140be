//! Named temperature presets, their room-by-room application, and the
//! global aggregator that reports the one preset every room shares.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::command::Command;
use crate::error::CommandError;
use crate::room::Room;

/// Aggregator value when rooms do not share a single preset.
pub const NO_PRESET: &str = "none";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub default_temperature: f64,
    /// Sparse per-room overrides keyed by room name.
    #[serde(default)]
    pub overrides: BTreeMap<String, f64>,
}

impl Preset {
    pub fn new(name: &str, default_temperature: f64) -> Self {
        Self {
            name: name.to_string(),
            default_temperature,
            overrides: BTreeMap::new(),
        }
    }

    pub fn temperature_for(&self, room: &str) -> f64 {
        self.overrides
            .get(room)
            .copied()
            .unwrap_or(self.default_temperature)
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if self.name.trim().is_empty() {
            return Err(CommandError::invalid("preset name", "must not be empty"));
        }
        if self.name.eq_ignore_ascii_case(NO_PRESET) {
            return Err(CommandError::ReservedPresetName(self.name.clone()));
        }
        if !self.default_temperature.is_finite() {
            return Err(CommandError::invalid(
                "default_temperature",
                format!("{} is not a finite number", self.default_temperature),
            ));
        }
        if let Some((room, t)) = self.overrides.iter().find(|(_, t)| !t.is_finite()) {
            return Err(CommandError::invalid(
                "overrides",
                format!("override for '{room}' ({t}) is not a finite number"),
            ));
        }
        Ok(())
    }
}

/// Night/Away profile used when nothing else is configured.
pub fn default_presets() -> Vec<Preset> {
    vec![Preset::new("Night", 19.5), Preset::new("Away", 15.0)]
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the preset catalogue. Presets are value objects: an edit replaces
/// the whole entry.
#[derive(Debug, Clone, Default)]
pub struct PresetManager {
    presets: BTreeMap<String, Preset>,
}

impl PresetManager {
    pub fn new(presets: impl IntoIterator<Item = Preset>) -> Self {
        Self {
            presets: presets.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.presets.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Preset> {
        self.presets.values()
    }

    pub fn add(&mut self, preset: Preset) -> Result<(), CommandError> {
        preset.validate()?;
        if self.presets.contains_key(&preset.name) {
            return Err(CommandError::DuplicatePreset(preset.name));
        }
        self.presets.insert(preset.name.clone(), preset);
        Ok(())
    }

    /// Replace preset `name` with `preset`, which may carry a new name.
    pub fn update(&mut self, name: &str, preset: Preset) -> Result<(), CommandError> {
        preset.validate()?;
        if !self.presets.contains_key(name) {
            return Err(CommandError::UnknownPreset(name.to_string()));
        }
        if preset.name != name && self.presets.contains_key(&preset.name) {
            return Err(CommandError::DuplicatePreset(preset.name));
        }
        self.presets.remove(name);
        self.presets.insert(preset.name.clone(), preset);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Preset, CommandError> {
        self.presets
            .remove(name)
            .ok_or_else(|| CommandError::UnknownPreset(name.to_string()))
    }

    /// Re-key overrides after a room rename.
    pub fn rename_room(&mut self, old: &str, new: &str) {
        for preset in self.presets.values_mut() {
            if let Some(t) = preset.overrides.remove(old) {
                preset.overrides.insert(new.to_string(), t);
            }
        }
    }

    /// Apply preset `name` to every room. Returns whether any room changed
    /// and the steering commands that fell out.
    pub fn apply<'a>(
        &self,
        name: &str,
        rooms: impl IntoIterator<Item = &'a mut Room>,
    ) -> Result<(bool, Vec<Command>), CommandError> {
        let preset = self
            .get(name)
            .ok_or_else(|| CommandError::UnknownPreset(name.to_string()))?;

        let mut changed = false;
        let mut commands = Vec::new();
        for room in rooms {
            let effect = room.set_preset(preset);
            changed |= effect.changed;
            commands.extend(effect.command);
        }
        Ok((changed, commands))
    }

    /// Unlink every room from its preset. Targets stay where they are.
    pub fn clear_all<'a>(&self, rooms: impl IntoIterator<Item = &'a mut Room>) -> bool {
        rooms
            .into_iter()
            .fold(false, |changed, room| room.clear_preset() | changed)
    }

    /// Unlink rooms that point at a preset that no longer exists.
    pub fn reconcile<'a>(&self, rooms: impl IntoIterator<Item = &'a mut Room>) -> bool {
        let mut changed = false;
        for room in rooms {
            let dangling = room.active_preset().is_some_and(|p| !self.contains(p));
            if dangling {
                changed |= room.clear_preset();
            }
        }
        changed
    }

    /// The single preset all rooms share, or [`NO_PRESET`] when the set is
    /// empty, any room is manual, or rooms disagree.
    pub fn global<'a>(&self, rooms: impl IntoIterator<Item = &'a Room>) -> String {
        let mut shared: Option<&str> = None;
        for room in rooms {
            let Some(active) = room.active_preset().filter(|p| self.contains(p)) else {
                return NO_PRESET.to_string();
            };
            match shared {
                None => shared = Some(active),
                Some(s) if s == active => {}
                Some(_) => return NO_PRESET.to_string(),
            }
        }
        shared.unwrap_or(NO_PRESET).to_string()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
