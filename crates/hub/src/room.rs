//! Per-room demand engine: tracks one room's readings, turns them into a
//! heat-demand percentage and steers the room's climate actuator around a
//! hysteresis band.
//!
//! ## Steering band
//!
//! ```text
//!   current < target - h   -> actuator to max setpoint, heating = true
//!   current > target + h   -> actuator to min setpoint, heating = false
//!   otherwise              -> no command, heating unchanged
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::Command;
use crate::preset::Preset;

pub const DEFAULT_HYSTERESIS: f64 = 0.3;
pub const DEFAULT_TARGET_TEMP: f64 = 21.0;

/// Temperature delta (°C below the comfort threshold) that maps to 100%.
const MAX_DELTA: f64 = 2.0;

/// Offset past the band used when the actuator has not reported its bounds.
const FALLBACK_SETPOINT_OFFSET: f64 = 5.0;

const TEMP_EPSILON: f64 = 1e-6;

/// Setpoints go out on the wire with one decimal place.
const SETPOINT_SCALE: f64 = 10.0;

// ---------------------------------------------------------------------------
// Config + snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub name: String,
    pub temperature_sensor: String,
    #[serde(default)]
    pub humidity_sensor: Option<String>,
    #[serde(default)]
    pub climate_entity: Option<String>,
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,
}

fn default_hysteresis() -> f64 {
    DEFAULT_HYSTERESIS
}

/// Setpoint range reported by a climate actuator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_temp: f64,
    pub max_temp: f64,
}

impl Bounds {
    pub fn new(min_temp: f64, max_temp: f64) -> Option<Self> {
        (min_temp.is_finite() && max_temp.is_finite() && min_temp <= max_temp)
            .then_some(Self { min_temp, max_temp })
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_temp, self.max_temp)
    }
}

/// Persisted part of a room's runtime state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSnapshot {
    pub target_temp: Option<f64>,
    pub active_preset: Option<String>,
}

/// What a single mutation did: whether observable state moved, and the
/// actuator command it wants sent, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomEffect {
    pub changed: bool,
    pub command: Option<Command>,
}

impl RoomEffect {
    fn unchanged() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Room {
    config: RoomConfig,

    current_temp: Option<f64>,
    current_humidity: Option<f64>,
    target_temp: f64,
    is_heating: bool,
    active_preset: Option<String>,

    // Learned from the climate actuator's own state reports.
    bounds: Option<Bounds>,
    actuator_setpoint: Option<f64>,
    // Last setpoint we asked for that the actuator has not yet echoed back.
    requested_setpoint: Option<f64>,
}

impl Room {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            current_temp: None,
            current_humidity: None,
            target_temp: DEFAULT_TARGET_TEMP,
            is_heating: false,
            active_preset: None,
            bounds: None,
            actuator_setpoint: None,
            requested_setpoint: None,
        }
    }

    /// Restore persisted target/preset. Missing fields keep their defaults.
    pub fn restore(&mut self, snapshot: &RoomSnapshot) {
        if let Some(t) = snapshot.target_temp.filter(|t| t.is_finite()) {
            self.target_temp = t;
        }
        self.active_preset = snapshot.active_preset.clone();
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            target_temp: Some(self.target_temp),
            active_preset: self.active_preset.clone(),
        }
    }

    // -- Reads --------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.current_temp
    }

    pub fn current_humidity(&self) -> Option<i32> {
        self.current_humidity.map(|h| h.trunc() as i32)
    }

    pub fn target_temperature(&self) -> f64 {
        self.target_temp
    }

    pub fn is_heating(&self) -> bool {
        self.is_heating
    }

    pub fn active_preset(&self) -> Option<&str> {
        self.active_preset.as_deref()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Heat demand 0–100 from how far the room sits below `target + h`.
    /// A full 2 °C deficit (or more) is 100%.
    pub fn heat_demand(&self) -> u8 {
        let Some(current) = self.current_temp else {
            return 0;
        };

        let delta = ((self.target_temp + self.config.hysteresis) - current).max(0.0);
        // Ties round to even so x.5 percentages land on the even neighbour.
        ((delta / MAX_DELTA).min(1.0) * 100.0).round_ties_even() as u8
    }

    // -- Sensor input -------------------------------------------------------

    /// Apply a raw temperature reading. Unparseable input keeps the previous
    /// value and changes nothing else.
    pub fn update_temperature(&mut self, raw: &str) -> RoomEffect {
        let Some(value) = parse_reading(raw) else {
            warn!(
                room = %self.config.name,
                raw,
                "invalid temperature reading, keeping previous value"
            );
            return RoomEffect::unchanged();
        };

        let mut changed = !same_temp(self.current_temp, Some(value));
        self.current_temp = Some(value);

        let command = self.steer(&mut changed);
        RoomEffect { changed, command }
    }

    /// Apply a raw humidity reading. Humidity is reported only; it never
    /// feeds demand or steering.
    pub fn update_humidity(&mut self, raw: &str) -> RoomEffect {
        let Some(value) = parse_reading(raw) else {
            warn!(
                room = %self.config.name,
                raw,
                "invalid humidity reading, keeping previous value"
            );
            return RoomEffect::unchanged();
        };

        let changed = !same_temp(self.current_humidity, Some(value));
        self.current_humidity = Some(value);
        RoomEffect {
            changed,
            command: None,
        }
    }

    /// Climate actuator reported its state. Bounds are cached on first
    /// report; the setpoint is recorded and steering re-evaluated so an
    /// externally moved actuator gets pulled back.
    pub fn on_climate_state(
        &mut self,
        setpoint: Option<f64>,
        bounds: Option<Bounds>,
    ) -> RoomEffect {
        let mut changed = false;

        if self.bounds.is_none() {
            if let Some(b) = bounds {
                debug!(
                    room = %self.config.name,
                    min = b.min_temp,
                    max = b.max_temp,
                    "climate bounds learned"
                );
                self.bounds = Some(b);
                let clamped = b.clamp(self.target_temp);
                if !same_temp(Some(clamped), Some(self.target_temp)) {
                    self.target_temp = clamped;
                    changed = true;
                }
            }
        }

        if let Some(sp) = setpoint.filter(|v| v.is_finite()) {
            self.actuator_setpoint = Some(sp);
            if !same_temp(self.requested_setpoint, Some(sp)) {
                self.requested_setpoint = None;
            }
        }

        let command = self.steer(&mut changed);
        RoomEffect { changed, command }
    }

    // -- User input ---------------------------------------------------------

    /// Manual target change. Always unlinks the active preset.
    pub fn set_target_temperature(&mut self, value: f64) -> RoomEffect {
        let value = self.clamp_target(value);
        let mut changed =
            !same_temp(Some(self.target_temp), Some(value)) || self.active_preset.is_some();
        self.target_temp = value;
        self.active_preset = None;

        let command = self.steer(&mut changed);
        RoomEffect { changed, command }
    }

    /// Apply a preset: override for this room if present, else the default.
    pub fn set_preset(&mut self, preset: &Preset) -> RoomEffect {
        let value = self.clamp_target(preset.temperature_for(&self.config.name));
        let mut changed = !same_temp(Some(self.target_temp), Some(value))
            || self.active_preset.as_deref() != Some(preset.name.as_str());
        self.target_temp = value;
        self.active_preset = Some(preset.name.clone());

        let command = self.steer(&mut changed);
        RoomEffect { changed, command }
    }

    /// Drop the preset link without touching the target.
    pub fn clear_preset(&mut self) -> bool {
        self.active_preset.take().is_some()
    }

    /// Carry runtime state over from the room this one replaces. Readings
    /// survive only when the sensor reference is unchanged; the bounds cache
    /// survives only when the climate actuator is unchanged.
    pub fn inherit(&mut self, previous: &Room) {
        self.target_temp = previous.target_temp;
        self.active_preset = previous.active_preset.clone();

        if previous.config.temperature_sensor == self.config.temperature_sensor {
            self.current_temp = previous.current_temp;
        }
        if previous.config.humidity_sensor == self.config.humidity_sensor {
            self.current_humidity = previous.current_humidity;
        }
        if previous.config.climate_entity == self.config.climate_entity {
            self.is_heating = previous.is_heating;
            self.bounds = previous.bounds;
            self.actuator_setpoint = previous.actuator_setpoint;
            self.requested_setpoint = previous.requested_setpoint;
        }
    }

    // -- Steering -----------------------------------------------------------

    fn clamp_target(&self, value: f64) -> f64 {
        match self.bounds {
            Some(b) => b.clamp(value),
            None => value,
        }
    }

    fn steer(&mut self, changed: &mut bool) -> Option<Command> {
        let entity = self.config.climate_entity.as_deref()?;
        let current = self.current_temp?;

        let low = self.target_temp - self.config.hysteresis;
        let high = self.target_temp + self.config.hysteresis;

        let (heating, setpoint) = if current < low {
            (true, self.bounds.map_or(high + FALLBACK_SETPOINT_OFFSET, |b| b.max_temp))
        } else if current > high {
            (false, self.bounds.map_or(low - FALLBACK_SETPOINT_OFFSET, |b| b.min_temp))
        } else {
            return None;
        };
        let setpoint = quantise_setpoint(setpoint);

        if self.is_heating != heating {
            self.is_heating = heating;
            *changed = true;
        }

        if same_temp(self.actuator_setpoint, Some(setpoint))
            || same_temp(self.requested_setpoint, Some(setpoint))
        {
            return None;
        }

        debug!(room = %self.config.name, current, low, high, setpoint, "steering climate actuator");
        self.requested_setpoint = Some(setpoint);
        Some(Command::climate(entity, setpoint))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a sensor state into a finite number. Host sentinels such as
/// `unknown` / `unavailable` fail like any other non-number.
fn parse_reading(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Round to the precision the actuator is actually sent, so its echo
/// compares equal to what was requested.
fn quantise_setpoint(value: f64) -> f64 {
    (value * SETPOINT_SCALE).round() / SETPOINT_SCALE
}

fn same_temp(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() < TEMP_EPSILON,
        (None, None) => true,
        _ => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
