//! Owns every room and the shared heater. Each entry point applies one
//! external event, then settles: dangling preset links are dropped, room
//! demand is averaged, the heater re-evaluates, and at most one "state
//! changed" signal goes out.

use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::CommandError;
use crate::heater::{HeaterConfig, HeaterController, HeaterSnapshot, OverrideMode};
use crate::mqtt::parse_switch_state;
use crate::preset::{Preset, PresetManager, NO_PRESET};
use crate::room::{Bounds, Room, RoomConfig, RoomEffect, RoomSnapshot};

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// A host entity reported a new state. Climate attributes are optional and
/// ignored for plain sensors and switches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityUpdate {
    pub state: String,
    pub setpoint: Option<f64>,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
}

impl EntityUpdate {
    pub fn state(state: &str) -> Self {
        Self {
            state: state.to_string(),
            ..Self::default()
        }
    }

    fn bounds(&self) -> Option<Bounds> {
        Bounds::new(self.min_temp?, self.max_temp?)
    }
}

/// Persisted runtime state of the whole system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub heater: HeaterSnapshot,
    pub rooms: BTreeMap<String, RoomSnapshot>,
}

/// What one settled event produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Fire-and-forget actuator commands, in issue order.
    pub commands: Vec<Command>,
    /// Observable state moved: persist the snapshot and notify observers.
    pub changed: bool,
}

impl Outcome {
    fn absorb(&mut self, effect: RoomEffect) {
        self.changed |= effect.changed;
        self.commands.extend(effect.command);
    }
}

// ---------------------------------------------------------------------------
// Read model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub aggregate_demand: f64,
    pub global_preset: String,
    pub heater: HeaterStatus,
    pub rooms: Vec<RoomStatus>,
    pub presets: Vec<Preset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaterStatus {
    pub entity: String,
    pub running: bool,
    pub override_mode: OverrideMode,
    pub heat_demand: f64,
    pub threshold_heat_demand: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_on: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_off: Option<OffsetDateTime>,
    pub cycles: u64,
    pub runtime_min: f64,
    pub min_on_s: u64,
    pub min_off_s: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    pub name: String,
    pub current_temperature: Option<f64>,
    pub current_humidity: Option<i32>,
    pub target_temperature: f64,
    pub heat_demand: u8,
    pub is_heating: bool,
    pub active_preset: Option<String>,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    heater: HeaterController,
    rooms: BTreeMap<String, Room>,
    presets: PresetManager,
    revision: watch::Sender<u64>,
}

impl Orchestrator {
    pub fn new(heater: HeaterConfig, rooms: Vec<RoomConfig>, presets: Vec<Preset>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            heater: HeaterController::new(heater),
            rooms: rooms
                .into_iter()
                .map(|cfg| (cfg.name.clone(), Room::new(cfg)))
                .collect(),
            presets: PresetManager::new(presets),
            revision,
        }
    }

    /// Restore persisted runtime state. Rooms or fields missing from the
    /// snapshot keep their defaults.
    pub fn load(&mut self, snapshot: &Snapshot) {
        self.heater.restore(&snapshot.heater);
        for (name, room) in self.rooms.iter_mut() {
            if let Some(s) = snapshot.rooms.get(name) {
                room.restore(s);
            }
        }
        self.presets.reconcile(self.rooms.values_mut());
        info!(
            rooms = self.rooms.len(),
            running = self.heater.is_running(),
            mode = %self.heater.override_mode(),
            "runtime state loaded"
        );
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            heater: self.heater.snapshot(),
            rooms: self
                .rooms
                .iter()
                .map(|(name, room)| (name.clone(), room.snapshot()))
                .collect(),
        }
    }

    /// Observers get one tick per settled event that changed state.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    // -- Queries ------------------------------------------------------------

    pub fn heater(&self) -> &HeaterController {
        &self.heater
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn presets(&self) -> &PresetManager {
        &self.presets
    }

    /// Mean demand over all rooms; rooms without readings count as 0.
    pub fn recompute_aggregate_demand(&self) -> f64 {
        if self.rooms.is_empty() {
            return 0.0;
        }
        let total: f64 = self.rooms.values().map(|r| f64::from(r.heat_demand())).sum();
        total / self.rooms.len() as f64
    }

    pub fn global_preset(&self) -> String {
        self.presets.global(self.rooms.values())
    }

    pub fn status(&self, now: OffsetDateTime) -> Status {
        let h = &self.heater;
        Status {
            aggregate_demand: self.recompute_aggregate_demand(),
            global_preset: self.global_preset(),
            heater: HeaterStatus {
                entity: h.entity().to_string(),
                running: h.is_running(),
                override_mode: h.override_mode(),
                heat_demand: h.heat_demand(),
                threshold_heat_demand: h.threshold(),
                last_on: h.last_on(),
                last_off: h.last_off(),
                cycles: h.cycles(),
                runtime_min: (h.runtime_s(now) / 60.0 * 100.0).round() / 100.0,
                min_on_s: h.config().min_on_s,
                min_off_s: h.config().min_off_s,
            },
            rooms: self
                .rooms
                .values()
                .map(|r| RoomStatus {
                    name: r.name().to_string(),
                    current_temperature: r.current_temperature(),
                    current_humidity: r.current_humidity(),
                    target_temperature: r.target_temperature(),
                    heat_demand: r.heat_demand(),
                    is_heating: r.is_heating(),
                    active_preset: r
                        .active_preset()
                        .filter(|p| self.presets.contains(p))
                        .map(str::to_string),
                    min_temp: r.bounds().map(|b| b.min_temp),
                    max_temp: r.bounds().map(|b| b.max_temp),
                })
                .collect(),
            presets: self.presets.iter().cloned().collect(),
        }
    }

    // -- Host events --------------------------------------------------------

    /// Route an entity state change to whoever references the entity. One
    /// sensor may feed several rooms; unknown entities are ignored.
    pub fn on_entity_state(
        &mut self,
        entity: &str,
        update: &EntityUpdate,
        now: OffsetDateTime,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        let mut matched = false;

        if entity == self.heater.entity() {
            matched = true;
            match parse_switch_state(&update.state) {
                Some(on) => outcome.changed |= self.heater.confirm_actuator_state(on, now),
                None => warn!(entity, state = %update.state, "unrecognised heater state, ignoring"),
            }
        }

        for room in self.rooms.values_mut() {
            let cfg = room.config();
            let is_temp = cfg.temperature_sensor == entity;
            let is_hum = cfg.humidity_sensor.as_deref() == Some(entity);
            let is_climate = cfg.climate_entity.as_deref() == Some(entity);

            if is_temp {
                outcome.absorb(room.update_temperature(&update.state));
            }
            if is_hum {
                outcome.absorb(room.update_humidity(&update.state));
            }
            if is_climate {
                outcome.absorb(room.on_climate_state(update.setpoint, update.bounds()));
            }
            matched |= is_temp || is_hum || is_climate;
        }

        if !matched {
            debug!(entity, "state for unreferenced entity, ignoring");
        }
        self.settle(outcome, now)
    }

    // -- User commands ------------------------------------------------------

    pub fn set_target_temperature(
        &mut self,
        room: &str,
        value: f64,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        if !value.is_finite() {
            return Err(CommandError::invalid(
                "temperature",
                format!("{value} is not a finite number"),
            ));
        }
        let room = self.room_mut(room)?;
        let mut outcome = Outcome::default();
        outcome.absorb(room.set_target_temperature(value));
        Ok(self.settle(outcome, now))
    }

    /// Link one room to a preset, or unlink it with `None`.
    pub fn set_room_preset(
        &mut self,
        room: &str,
        preset: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        let preset = match preset {
            Some(name) => Some(
                self.presets
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CommandError::UnknownPreset(name.to_string()))?,
            ),
            None => None,
        };
        let room = self.room_mut(room)?;

        let mut outcome = Outcome::default();
        match preset {
            Some(p) => outcome.absorb(room.set_preset(&p)),
            None => outcome.changed |= room.clear_preset(),
        }
        Ok(self.settle(outcome, now))
    }

    pub fn apply_preset(
        &mut self,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        let (changed, commands) = self.presets.apply(name, self.rooms.values_mut())?;
        info!(preset = name, rooms = self.rooms.len(), "preset applied to all rooms");
        Ok(self.settle(Outcome { commands, changed }, now))
    }

    pub fn clear_presets(&mut self, now: OffsetDateTime) -> Outcome {
        let changed = self.presets.clear_all(self.rooms.values_mut());
        self.settle(Outcome { commands: Vec::new(), changed }, now)
    }

    /// Global select: `none` unlinks every room, any other option applies.
    pub fn select_global_preset(
        &mut self,
        option: &str,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        if option.eq_ignore_ascii_case(NO_PRESET) {
            Ok(self.clear_presets(now))
        } else {
            self.apply_preset(option, now)
        }
    }

    pub fn set_override_mode(&mut self, mode: OverrideMode, now: OffsetDateTime) -> Outcome {
        let previous = self.heater.override_mode();
        let command = self.heater.set_override_mode(mode);
        let outcome = Outcome {
            commands: command.into_iter().collect(),
            changed: previous != mode,
        };
        self.settle(outcome, now)
    }

    pub fn set_threshold(
        &mut self,
        value: f64,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        let changed = self.heater.set_threshold(value)?;
        Ok(self.settle(Outcome { commands: Vec::new(), changed }, now))
    }

    // -- Configuration ------------------------------------------------------

    pub fn add_room(
        &mut self,
        config: RoomConfig,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        validate_room(&config)?;
        if self.rooms.contains_key(&config.name) {
            return Err(CommandError::DuplicateRoom(config.name));
        }
        info!(room = %config.name, "room added");
        self.rooms.insert(config.name.clone(), Room::new(config));
        Ok(self.settle(Outcome { commands: Vec::new(), changed: true }, now))
    }

    /// Replace room `name`'s configuration; a different `config.name`
    /// renames it. Target and preset link carry over.
    pub fn update_room(
        &mut self,
        name: &str,
        config: RoomConfig,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        validate_room(&config)?;
        if !self.rooms.contains_key(name) {
            return Err(CommandError::UnknownRoom(name.to_string()));
        }
        if config.name != name && self.rooms.contains_key(&config.name) {
            return Err(CommandError::DuplicateRoom(config.name));
        }

        let mut room = Room::new(config);
        if let Some(previous) = self.rooms.remove(name) {
            room.inherit(&previous);
        }
        if room.name() != name {
            info!(from = name, to = room.name(), "room renamed");
            self.presets.rename_room(name, room.name());
        }
        self.rooms.insert(room.name().to_string(), room);
        Ok(self.settle(Outcome { commands: Vec::new(), changed: true }, now))
    }

    pub fn remove_room(
        &mut self,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        self.rooms
            .remove(name)
            .ok_or_else(|| CommandError::UnknownRoom(name.to_string()))?;
        info!(room = name, "room removed");
        Ok(self.settle(Outcome { commands: Vec::new(), changed: true }, now))
    }

    pub fn add_preset(
        &mut self,
        preset: Preset,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        info!(preset = %preset.name, "preset added");
        self.presets.add(preset)?;
        Ok(self.settle(Outcome { commands: Vec::new(), changed: true }, now))
    }

    /// Replace preset `name`. Rooms linked to it follow the new values.
    pub fn update_preset(
        &mut self,
        name: &str,
        preset: Preset,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        let new_name = preset.name.clone();
        self.presets.update(name, preset.clone())?;

        let mut outcome = Outcome { commands: Vec::new(), changed: true };
        for room in self.rooms.values_mut() {
            if room.active_preset() == Some(name) {
                outcome.absorb(room.set_preset(&preset));
            }
        }
        info!(preset = name, to = %new_name, "preset updated");
        Ok(self.settle(outcome, now))
    }

    pub fn remove_preset(
        &mut self,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        self.presets.remove(name)?;
        info!(preset = name, "preset removed");
        // Linked rooms fall back to manual in settle().
        Ok(self.settle(Outcome { commands: Vec::new(), changed: true }, now))
    }

    // -- Settle -------------------------------------------------------------

    fn settle(&mut self, mut outcome: Outcome, now: OffsetDateTime) -> Outcome {
        outcome.changed |= self.presets.reconcile(self.rooms.values_mut());

        let aggregate = self.recompute_aggregate_demand();
        let effect = self.heater.apply_heat_demand(aggregate, now);
        outcome.changed |= effect.changed;
        outcome.commands.extend(effect.command);

        if outcome.changed {
            self.revision.send_modify(|rev| *rev += 1);
        }
        outcome
    }

    fn room_mut(&mut self, name: &str) -> Result<&mut Room, CommandError> {
        self.rooms
            .get_mut(name)
            .ok_or_else(|| CommandError::UnknownRoom(name.to_string()))
    }
}

pub fn validate_room(config: &RoomConfig) -> Result<(), CommandError> {
    if config.name.trim().is_empty() {
        return Err(CommandError::invalid("room name", "must not be empty"));
    }
    if config.temperature_sensor.trim().is_empty() {
        return Err(CommandError::invalid("temperature_sensor", "must not be empty"));
    }
    if config.humidity_sensor.as_deref().is_some_and(|s| s.trim().is_empty()) {
        return Err(CommandError::invalid("humidity_sensor", "must not be blank when set"));
    }
    if config.climate_entity.as_deref().is_some_and(|s| s.trim().is_empty()) {
        return Err(CommandError::invalid("climate_entity", "must not be blank when set"));
    }
    if !config.hysteresis.is_finite() || config.hysteresis <= 0.0 {
        return Err(CommandError::invalid(
            "hysteresis",
            format!("must be a positive number, got {}", config.hysteresis),
        ));
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::DEFAULT_TARGET_TEMP;
    use time::Duration;

    const HEATER: &str = "switch.boiler";

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap() + Duration::seconds(secs)
    }

    fn room_cfg(name: &str) -> RoomConfig {
        let slug = name.to_lowercase().replace(' ', "_");
        RoomConfig {
            name: name.into(),
            temperature_sensor: format!("sensor.{slug}_temp"),
            humidity_sensor: Some(format!("sensor.{slug}_hum")),
            climate_entity: None,
            hysteresis: 0.3,
        }
    }

    fn orchestrator(rooms: &[&str]) -> Orchestrator {
        let mut night = Preset::new("Night", 19.5);
        night.overrides.insert("Bedroom".into(), 18.0);
        let mut orch = Orchestrator::new(
            HeaterConfig {
                entity: HEATER.into(),
                min_on_s: 300,
                min_off_s: 300,
            },
            rooms.iter().map(|r| room_cfg(r)).collect(),
            vec![night, Preset::new("Away", 15.0)],
        );
        orch.set_threshold(30.0, at(0)).unwrap();
        orch
    }

    fn reading(orch: &mut Orchestrator, entity: &str, value: &str, secs: i64) -> Outcome {
        orch.on_entity_state(entity, &EntityUpdate::state(value), at(secs))
    }

    // -- Aggregation ------------------------------------------------------

    #[test]
    fn aggregate_zero_without_rooms() {
        let orch = orchestrator(&[]);
        assert_eq!(orch.recompute_aggregate_demand(), 0.0);
    }

    #[test]
    fn aggregate_is_mean_of_rooms() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        // 21.3 - 20.3 = 1.0 -> 50%
        reading(&mut orch, "sensor.bedroom_temp", "20.3", 1);
        reading(&mut orch, "sensor.kitchen_temp", "20.3", 2);
        assert_eq!(orch.recompute_aggregate_demand(), 50.0);
    }

    #[test]
    fn rooms_without_readings_count_as_zero() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        reading(&mut orch, "sensor.bedroom_temp", "19.0", 1);
        assert_eq!(orch.recompute_aggregate_demand(), 50.0);
    }

    // -- Event routing ----------------------------------------------------

    #[test]
    fn sensor_reading_drives_heater() {
        let mut orch = orchestrator(&["Bedroom"]);
        let outcome = reading(&mut orch, "sensor.bedroom_temp", "19.0", 1);
        assert!(outcome.changed);
        assert_eq!(outcome.commands, vec![Command::switch(HEATER, true)]);
        assert_eq!(orch.heater().heat_demand(), 100.0);
    }

    #[test]
    fn heater_feedback_confirms_state() {
        let mut orch = orchestrator(&["Bedroom"]);
        let outcome = reading(&mut orch, HEATER, "on", 5);
        assert!(outcome.changed);
        assert!(orch.heater().is_running());
        assert_eq!(orch.heater().last_on(), Some(at(5)));

        let again = reading(&mut orch, HEATER, "on", 6);
        assert!(!again.changed);
    }

    #[test]
    fn unparseable_reading_is_a_no_op() {
        let mut orch = orchestrator(&["Bedroom"]);
        reading(&mut orch, "sensor.bedroom_temp", "20.0", 1);
        let outcome = reading(&mut orch, "sensor.bedroom_temp", "unavailable", 2);
        assert_eq!(outcome, Outcome::default());
        assert_eq!(orch.room("Bedroom").unwrap().current_temperature(), Some(20.0));
    }

    #[test]
    fn unknown_entity_ignored() {
        let mut orch = orchestrator(&["Bedroom"]);
        assert_eq!(reading(&mut orch, "sensor.garage", "12", 1), Outcome::default());
    }

    #[test]
    fn shared_sensor_feeds_every_room() {
        let mut orch = orchestrator(&[]);
        for name in ["Hall", "Stairs"] {
            orch.add_room(
                RoomConfig {
                    temperature_sensor: "sensor.landing".into(),
                    ..room_cfg(name)
                },
                at(0),
            )
            .unwrap();
        }
        reading(&mut orch, "sensor.landing", "18.5", 1);
        assert!(orch.rooms().all(|r| r.current_temperature() == Some(18.5)));
    }

    #[test]
    fn climate_state_learns_bounds_and_steers() {
        let mut orch = orchestrator(&[]);
        orch.add_room(
            RoomConfig {
                climate_entity: Some("climate.bedroom_trv".into()),
                ..room_cfg("Bedroom")
            },
            at(0),
        )
        .unwrap();
        reading(&mut orch, "sensor.bedroom_temp", "20.0", 1);

        let update = EntityUpdate {
            state: "heat".into(),
            setpoint: Some(17.0),
            min_temp: Some(7.0),
            max_temp: Some(28.0),
        };
        let outcome = orch.on_entity_state("climate.bedroom_trv", &update, at(2));
        assert!(outcome.commands.contains(&Command::climate("climate.bedroom_trv", 28.0)));
        let status = orch.status(at(2));
        assert_eq!(status.rooms[0].max_temp, Some(28.0));
        assert!(status.rooms[0].is_heating);
    }

    // -- Scenario: anti-cycle through the whole pipeline -------------------

    #[test]
    fn demand_spike_turns_heater_on_once() {
        let mut orch = orchestrator(&["Bedroom"]);
        let mut commands = Vec::new();
        // 21.3 - 22.0 -> 0%, 21.3 - 20.5 -> 40%, back to 0%.
        for (secs, value) in [(0, "22.0"), (20, "20.5"), (60, "22.0")] {
            commands.extend(reading(&mut orch, "sensor.bedroom_temp", value, secs).commands);
        }
        assert_eq!(commands, vec![Command::switch(HEATER, true)]);
    }

    #[test]
    fn confirmed_run_not_cut_before_min_on() {
        let mut orch = orchestrator(&["Bedroom"]);
        reading(&mut orch, "sensor.bedroom_temp", "19.0", 0);
        reading(&mut orch, HEATER, "on", 1);

        let early = reading(&mut orch, "sensor.bedroom_temp", "23.0", 100);
        assert!(early.commands.is_empty());

        // Any later event re-runs the check once the window has passed.
        let later = reading(&mut orch, "sensor.bedroom_hum", "45", 301);
        assert_eq!(later.commands, vec![Command::switch(HEATER, false)]);
    }

    // -- Override / threshold ---------------------------------------------

    #[test]
    fn override_commands_and_auto_resume() {
        let mut orch = orchestrator(&["Bedroom"]);
        let forced = orch.set_override_mode(OverrideMode::On, at(0));
        assert_eq!(forced.commands, vec![Command::switch(HEATER, true)]);
        assert!(orch.heater().is_running());

        let repeat = orch.set_override_mode(OverrideMode::On, at(1));
        assert!(repeat.commands.is_empty());
        assert!(!repeat.changed);

        // Back to auto with a cold room: demand logic takes over at once.
        reading(&mut orch, "sensor.bedroom_temp", "19.0", 2);
        let auto = orch.set_override_mode(OverrideMode::Auto, at(3));
        assert_eq!(auto.commands, vec![Command::switch(HEATER, true)]);
    }

    #[test]
    fn threshold_rejects_nan() {
        let mut orch = orchestrator(&["Bedroom"]);
        assert!(orch.set_threshold(f64::NAN, at(0)).is_err());
        assert_eq!(orch.heater().threshold(), 30.0);
    }

    // -- Presets ----------------------------------------------------------

    #[test]
    fn global_preset_round_trip() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        assert_eq!(orch.global_preset(), NO_PRESET);

        orch.apply_preset("Night", at(0)).unwrap();
        assert_eq!(orch.room("Bedroom").unwrap().target_temperature(), 18.0);
        assert_eq!(orch.room("Kitchen").unwrap().target_temperature(), 19.5);
        assert_eq!(orch.global_preset(), "Night");

        orch.set_target_temperature("Kitchen", 21.0, at(1)).unwrap();
        assert_eq!(orch.global_preset(), NO_PRESET);
    }

    #[test]
    fn select_none_clears_links_keeps_targets() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        orch.select_global_preset("Away", at(0)).unwrap();
        let outcome = orch.select_global_preset("none", at(1)).unwrap();
        assert!(outcome.changed);
        assert!(orch.rooms().all(|r| r.active_preset().is_none()));
        assert!(orch.rooms().all(|r| r.target_temperature() == 15.0));
    }

    #[test]
    fn room_preset_per_room_then_global_agrees() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        orch.set_room_preset("Bedroom", Some("Night"), at(0)).unwrap();
        assert_eq!(orch.global_preset(), NO_PRESET);
        orch.set_room_preset("Kitchen", Some("Night"), at(1)).unwrap();
        assert_eq!(orch.global_preset(), "Night");

        orch.set_room_preset("Kitchen", None, at(2)).unwrap();
        assert_eq!(orch.room("Kitchen").unwrap().active_preset(), None);
    }

    #[test]
    fn removing_preset_unlinks_rooms() {
        let mut orch = orchestrator(&["Bedroom"]);
        orch.apply_preset("Away", at(0)).unwrap();
        orch.remove_preset("Away", at(1)).unwrap();
        assert_eq!(orch.room("Bedroom").unwrap().active_preset(), None);
        assert_eq!(orch.room("Bedroom").unwrap().target_temperature(), 15.0);
    }

    #[test]
    fn editing_preset_moves_linked_rooms() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        orch.apply_preset("Away", at(0)).unwrap();
        orch.set_target_temperature("Kitchen", 20.0, at(1)).unwrap();

        orch.update_preset("Away", Preset::new("Away", 12.0), at(2)).unwrap();
        assert_eq!(orch.room("Bedroom").unwrap().target_temperature(), 12.0);
        assert_eq!(orch.room("Kitchen").unwrap().target_temperature(), 20.0);
    }

    #[test]
    fn unknown_preset_and_room_rejected() {
        let mut orch = orchestrator(&["Bedroom"]);
        assert_eq!(
            orch.apply_preset("Party", at(0)),
            Err(CommandError::UnknownPreset("Party".into()))
        );
        assert_eq!(
            orch.set_target_temperature("Attic", 20.0, at(0)),
            Err(CommandError::UnknownRoom("Attic".into()))
        );
        assert_eq!(
            orch.set_room_preset("Bedroom", Some("Party"), at(0)),
            Err(CommandError::UnknownPreset("Party".into()))
        );
    }

    // -- Rooms ------------------------------------------------------------

    #[test]
    fn duplicate_room_rejected_without_mutation() {
        let mut orch = orchestrator(&["Bedroom"]);
        orch.set_target_temperature("Bedroom", 23.0, at(0)).unwrap();
        assert_eq!(
            orch.add_room(room_cfg("Bedroom"), at(1)),
            Err(CommandError::DuplicateRoom("Bedroom".into()))
        );
        assert_eq!(orch.room("Bedroom").unwrap().target_temperature(), 23.0);
    }

    #[test]
    fn invalid_room_rejected() {
        let mut orch = orchestrator(&[]);
        let err = orch
            .add_room(RoomConfig { hysteresis: 0.0, ..room_cfg("Bedroom") }, at(0))
            .unwrap_err();
        assert!(matches!(err, CommandError::Invalid { field: "hysteresis", .. }));
    }

    #[test]
    fn blank_optional_entities_rejected() {
        let mut orch = orchestrator(&["Bedroom"]);
        let err = orch
            .add_room(RoomConfig { climate_entity: Some(" ".into()), ..room_cfg("Study") }, at(0))
            .unwrap_err();
        assert!(matches!(err, CommandError::Invalid { field: "climate_entity", .. }));

        let err = orch
            .update_room(
                "Bedroom",
                RoomConfig { humidity_sensor: Some(String::new()), ..room_cfg("Bedroom") },
                at(1),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::Invalid { field: "humidity_sensor", .. }));
        assert!(orch.room("Study").is_none());
        assert_eq!(
            orch.room("Bedroom").unwrap().config().humidity_sensor.as_deref(),
            Some("sensor.bedroom_hum")
        );
    }

    #[test]
    fn rename_room_carries_state_and_overrides() {
        let mut orch = orchestrator(&["Bedroom"]);
        orch.apply_preset("Night", at(0)).unwrap();

        let renamed = RoomConfig {
            name: "Master Bedroom".into(),
            ..room_cfg("Bedroom")
        };
        orch.update_room("Bedroom", renamed, at(1)).unwrap();

        let room = orch.room("Master Bedroom").unwrap();
        assert_eq!(room.target_temperature(), 18.0);
        assert_eq!(room.active_preset(), Some("Night"));
        assert_eq!(
            orch.presets().get("Night").unwrap().temperature_for("Master Bedroom"),
            18.0
        );
        assert!(orch.room("Bedroom").is_none());
    }

    #[test]
    fn remove_room_updates_aggregate() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        reading(&mut orch, "sensor.bedroom_temp", "19.0", 0);
        assert_eq!(orch.recompute_aggregate_demand(), 50.0);
        orch.remove_room("Kitchen", at(1)).unwrap();
        assert_eq!(orch.recompute_aggregate_demand(), 100.0);
        assert_eq!(
            orch.remove_room("Kitchen", at(2)),
            Err(CommandError::UnknownRoom("Kitchen".into()))
        );
    }

    // -- Snapshot + notification ------------------------------------------

    #[test]
    fn snapshot_round_trip() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        orch.apply_preset("Night", at(0)).unwrap();
        orch.set_target_temperature("Kitchen", 22.5, at(1)).unwrap();
        reading(&mut orch, HEATER, "on", 2);
        let snap = orch.snapshot();

        let mut fresh = orchestrator(&["Bedroom", "Kitchen"]);
        fresh.load(&snap);
        assert_eq!(fresh.snapshot(), snap);
        assert_eq!(fresh.global_preset(), NO_PRESET);
        assert_eq!(fresh.room("Bedroom").unwrap().active_preset(), Some("Night"));
        assert!(fresh.heater().is_running());
    }

    #[test]
    fn load_with_missing_room_uses_defaults() {
        let mut orch = orchestrator(&["Bedroom"]);
        orch.load(&Snapshot::default());
        assert_eq!(orch.room("Bedroom").unwrap().target_temperature(), DEFAULT_TARGET_TEMP);
        assert_eq!(orch.heater().override_mode(), OverrideMode::Auto);
    }

    #[test]
    fn one_notification_per_changed_event() {
        let mut orch = orchestrator(&["Bedroom", "Kitchen"]);
        let rx = orch.subscribe();
        let before = *rx.borrow();

        // Touches two rooms and the heater demand, still one tick.
        orch.apply_preset("Night", at(0)).unwrap();
        assert_eq!(*rx.borrow(), before + 1);

        // No-op event: no tick.
        orch.clear_presets(at(1));
        orch.clear_presets(at(2));
        assert_eq!(*rx.borrow(), before + 2);
    }
}
