//! Anti-short-cycle controller for the shared heat source.
//!
//! ## States
//!
//! ```text
//!            demand >= threshold && off for >= min_off
//!   Off ────────────────────────────────────────────────▶ Running
//!    ▲                                                       │
//!    └───────── !should_run && on for >= min_on ─────────────┘
//!
//!   should_run = demand >= threshold || (running && demand > 0)
//! ```
//!
//! Commands are requests only. `running`, `last_on` and `last_off` move
//! exclusively through [`HeaterController::confirm_actuator_state`], fed by
//! the actuator's own state reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::command::Command;
use crate::error::CommandError;

pub const DEFAULT_MIN_ON_S: u64 = 8 * 60;
pub const DEFAULT_MIN_OFF_S: u64 = 5 * 60;

// ---------------------------------------------------------------------------
// Config / mode / snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub entity: String,
    #[serde(default = "default_min_on")]
    pub min_on_s: u64,
    #[serde(default = "default_min_off")]
    pub min_off_s: u64,
}

fn default_min_on() -> u64 {
    DEFAULT_MIN_ON_S
}

fn default_min_off() -> u64 {
    DEFAULT_MIN_OFF_S
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMode {
    /// Demand-driven.
    #[default]
    Auto,
    /// Forced on.
    On,
    /// Forced off.
    Off,
}

impl OverrideMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for OverrideMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverrideMode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            _ => Err(CommandError::InvalidMode(s.to_string())),
        }
    }
}

/// Everything needed to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaterSnapshot {
    pub is_running: bool,
    pub last_on: Option<OffsetDateTime>,
    pub last_off: Option<OffsetDateTime>,
    pub heat_demand: f64,
    pub threshold_heat_demand: f64,
    pub override_mode: OverrideMode,
    pub cycles: u64,
    pub total_runtime_s: f64,
}

/// Result of feeding a new demand value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaterEffect {
    /// Recorded demand moved; persist and notify.
    pub changed: bool,
    pub command: Option<Command>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HeaterController {
    config: HeaterConfig,

    // Last state the actuator itself reported.
    confirmed_on: bool,
    last_on: Option<OffsetDateTime>,
    last_off: Option<OffsetDateTime>,

    heat_demand: f64,
    threshold: f64,
    mode: OverrideMode,

    cycles: u64,
    total_runtime_s: f64,

    // State we asked for and have not yet seen confirmed.
    pending: Option<bool>,
}

impl HeaterController {
    pub fn new(config: HeaterConfig) -> Self {
        Self {
            config,
            confirmed_on: false,
            last_on: None,
            last_off: None,
            heat_demand: 0.0,
            threshold: 0.0,
            mode: OverrideMode::Auto,
            cycles: 0,
            total_runtime_s: 0.0,
            pending: None,
        }
    }

    pub fn restore(&mut self, s: &HeaterSnapshot) {
        self.confirmed_on = s.is_running;
        self.last_on = s.last_on;
        self.last_off = s.last_off;
        self.heat_demand = if s.heat_demand.is_finite() { s.heat_demand } else { 0.0 };
        self.threshold = clamp_percent(s.threshold_heat_demand);
        self.mode = s.override_mode;
        self.cycles = s.cycles;
        self.total_runtime_s = s.total_runtime_s.max(0.0);
        self.pending = None;
    }

    pub fn snapshot(&self) -> HeaterSnapshot {
        HeaterSnapshot {
            is_running: self.confirmed_on,
            last_on: self.last_on,
            last_off: self.last_off,
            heat_demand: self.heat_demand,
            threshold_heat_demand: self.threshold,
            override_mode: self.mode,
            cycles: self.cycles,
            total_runtime_s: self.total_runtime_s,
        }
    }

    // -- Reads --------------------------------------------------------------

    pub fn config(&self) -> &HeaterConfig {
        &self.config
    }

    pub fn entity(&self) -> &str {
        &self.config.entity
    }

    /// Forced state while overridden, last confirmed state in auto.
    pub fn is_running(&self) -> bool {
        match self.mode {
            OverrideMode::Auto => self.confirmed_on,
            OverrideMode::On => true,
            OverrideMode::Off => false,
        }
    }

    pub fn override_mode(&self) -> OverrideMode {
        self.mode
    }

    pub fn heat_demand(&self) -> f64 {
        self.heat_demand
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn last_on(&self) -> Option<OffsetDateTime> {
        self.last_on
    }

    pub fn last_off(&self) -> Option<OffsetDateTime> {
        self.last_off
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Total burner runtime, including the run in progress.
    pub fn runtime_s(&self, now: OffsetDateTime) -> f64 {
        let current = match (self.confirmed_on, self.last_on) {
            (true, Some(on)) => (now - on).as_seconds_f64().max(0.0),
            _ => 0.0,
        };
        self.total_runtime_s + current
    }

    // -- Commands -----------------------------------------------------------

    /// Switch override mode. Entering `on`/`off` forces the actuator once;
    /// re-selecting the current mode does nothing.
    pub fn set_override_mode(&mut self, mode: OverrideMode) -> Option<Command> {
        if mode == self.mode {
            return None;
        }
        info!(from = %self.mode, to = %mode, "heater override mode changed");
        self.mode = mode;

        let forced = match mode {
            OverrideMode::Auto => {
                self.pending = None;
                return None;
            }
            OverrideMode::On => true,
            OverrideMode::Off => false,
        };
        self.pending = Some(forced);
        Some(Command::switch(&self.config.entity, forced))
    }

    /// Set the demand threshold, clamped to 0–100. Returns whether it moved.
    pub fn set_threshold(&mut self, value: f64) -> Result<bool, CommandError> {
        if !value.is_finite() {
            return Err(CommandError::invalid(
                "threshold",
                format!("{value} is not a finite number"),
            ));
        }
        let value = clamp_percent(value);
        let changed = value != self.threshold;
        self.threshold = value;
        Ok(changed)
    }

    /// Record the aggregate demand and run the transition check.
    ///
    /// An unchanged demand is not reported as a change, but the check still
    /// runs so a transition deferred by the anti-cycle guard is picked up on
    /// the next event.
    pub fn apply_heat_demand(&mut self, demand: f64, now: OffsetDateTime) -> HeaterEffect {
        let demand = clamp_percent(demand);
        let changed = demand != self.heat_demand;
        if changed {
            self.heat_demand = demand;
            // A fresh decision may re-send a command that was lost.
            self.pending = None;
        }

        HeaterEffect {
            changed,
            command: self.evaluate(now),
        }
    }

    /// Actuator reported its state. The only path that moves `running`,
    /// `last_on`, `last_off`, the cycle counter and the runtime total.
    pub fn confirm_actuator_state(&mut self, on: bool, now: OffsetDateTime) -> bool {
        if self.pending == Some(on) {
            self.pending = None;
        }
        if on == self.confirmed_on {
            return false;
        }

        if on {
            self.last_on = Some(now);
            self.cycles += 1;
        } else {
            self.last_off = Some(now);
            if let Some(started) = self.last_on {
                self.total_runtime_s += (now - started).as_seconds_f64().max(0.0);
            }
        }
        self.confirmed_on = on;
        self.pending = None;

        info!(running = on, cycles = self.cycles, "heater state confirmed");
        true
    }

    // -- Decision -----------------------------------------------------------

    fn evaluate(&mut self, now: OffsetDateTime) -> Option<Command> {
        if self.mode != OverrideMode::Auto {
            return None;
        }

        let running = self.confirmed_on;
        let demand = self.heat_demand;
        let should_run = demand >= self.threshold || (running && demand > 0.0);

        if should_run == running {
            return None;
        }

        let (since, min_dwell) = if should_run {
            (self.last_off, self.config.min_off_s)
        } else {
            (self.last_on, self.config.min_on_s)
        };
        if let Some(since) = since {
            let elapsed = (now - since).as_seconds_f64();
            if elapsed < min_dwell as f64 {
                debug!(
                    want_on = should_run,
                    remaining_s = min_dwell as f64 - elapsed,
                    "heater transition deferred by anti-cycle window"
                );
                return None;
            }
        }

        if self.pending == Some(should_run) {
            return None;
        }

        info!(on = should_run, demand, threshold = self.threshold, "heater transition requested");
        self.pending = Some(should_run);
        Some(Command::switch(&self.config.entity, should_run))
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    const ENTITY: &str = "switch.boiler";

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn at(secs: i64) -> OffsetDateTime {
        t0() + Duration::seconds(secs)
    }

    fn heater(threshold: f64) -> HeaterController {
        let mut h = HeaterController::new(HeaterConfig {
            entity: ENTITY.into(),
            min_on_s: 300,
            min_off_s: 300,
        });
        h.set_threshold(threshold).unwrap();
        h
    }

    fn on() -> Option<Command> {
        Some(Command::switch(ENTITY, true))
    }

    fn off() -> Option<Command> {
        Some(Command::switch(ENTITY, false))
    }

    // -- Off -> Running ---------------------------------------------------

    #[test]
    fn turns_on_when_demand_reaches_threshold() {
        let mut h = heater(30.0);
        assert_eq!(h.apply_heat_demand(20.0, at(0)).command, None);
        assert_eq!(h.apply_heat_demand(30.0, at(1)).command, on());
    }

    #[test]
    fn min_off_window_defers_turn_on() {
        let mut h = heater(30.0);
        h.confirm_actuator_state(true, at(0));
        h.confirm_actuator_state(false, at(600));

        assert_eq!(h.apply_heat_demand(50.0, at(700)).command, None);
        // Same demand, later event: deferred decision re-evaluated.
        let effect = h.apply_heat_demand(50.0, at(900));
        assert!(!effect.changed);
        assert_eq!(effect.command, on());
    }

    // -- Running -> Off ---------------------------------------------------

    #[test]
    fn min_on_window_blocks_turn_off() {
        let mut h = heater(30.0);
        h.apply_heat_demand(80.0, at(0));
        h.confirm_actuator_state(true, at(0));

        for (i, d) in [0.0, 10.0, 0.0, 50.0, 0.0].into_iter().enumerate() {
            let effect = h.apply_heat_demand(d, at(10 + i as i64 * 50));
            assert_ne!(effect.command, off(), "turned off at step {i}");
        }
        assert_eq!(h.apply_heat_demand(0.0, at(300)).command, off());
    }

    #[test]
    fn running_with_positive_demand_stays_on_below_threshold() {
        let mut h = heater(30.0);
        h.apply_heat_demand(80.0, at(0));
        h.confirm_actuator_state(true, at(0));

        assert_eq!(h.apply_heat_demand(5.0, at(1_000)).command, None);
        assert_eq!(h.apply_heat_demand(0.0, at(1_001)).command, off());
    }

    // -- Scenario: 0 -> 40 -> 0 within 60s --------------------------------

    #[test]
    fn short_demand_spike_turns_on_once_and_never_off_early() {
        let mut h = heater(30.0);
        let mut commands = Vec::new();
        for (secs, demand) in [(0, 0.0), (20, 40.0), (60, 0.0)] {
            commands.extend(h.apply_heat_demand(demand, at(secs)).command);
        }
        // Threshold 30 with demand 0 does not start; 40 does; 0 while the
        // actuator never confirmed leaves nothing to turn off.
        assert_eq!(commands, vec![Command::switch(ENTITY, true)]);
    }

    #[test]
    fn pending_command_not_repeated_before_feedback() {
        let mut h = heater(30.0);
        assert_eq!(h.apply_heat_demand(40.0, at(0)).command, on());
        assert_eq!(h.apply_heat_demand(40.0, at(5)).command, None);
        assert_eq!(h.apply_heat_demand(40.0, at(10)).command, None);
    }

    #[test]
    fn changed_demand_resends_lost_command() {
        let mut h = heater(30.0);
        assert_eq!(h.apply_heat_demand(40.0, at(0)).command, on());
        assert_eq!(h.apply_heat_demand(45.0, at(5)).command, on());
    }

    #[test]
    fn zero_threshold_runs_even_at_zero_demand() {
        let mut h = heater(0.0);
        assert_eq!(h.apply_heat_demand(0.0, at(0)).command, on());
    }

    #[test]
    fn identical_demand_not_reported_as_change() {
        let mut h = heater(30.0);
        assert!(h.apply_heat_demand(10.0, at(0)).changed);
        assert!(!h.apply_heat_demand(10.0, at(1)).changed);
    }

    // -- Feedback ---------------------------------------------------------

    #[test]
    fn feedback_tracks_timestamps_cycles_and_runtime() {
        let mut h = heater(30.0);
        assert!(h.confirm_actuator_state(true, at(0)));
        assert!(!h.confirm_actuator_state(true, at(10)));
        assert_eq!(h.last_on(), Some(at(0)));
        assert_eq!(h.cycles(), 1);
        assert_eq!(h.runtime_s(at(60)), 60.0);

        assert!(h.confirm_actuator_state(false, at(120)));
        assert_eq!(h.last_off(), Some(at(120)));
        assert_eq!(h.runtime_s(at(500)), 120.0);

        h.confirm_actuator_state(true, at(600));
        assert_eq!(h.cycles(), 2);
        assert_eq!(h.last_on(), Some(at(600)));
    }

    #[test]
    fn manual_switch_flip_is_reflected() {
        let mut h = heater(30.0);
        h.confirm_actuator_state(true, at(0));
        assert!(h.is_running());
        h.confirm_actuator_state(false, at(30));
        assert!(!h.is_running());
    }

    // -- Override ---------------------------------------------------------

    #[test]
    fn override_on_forces_once() {
        let mut h = heater(30.0);
        assert_eq!(h.set_override_mode(OverrideMode::On), on());
        assert_eq!(h.set_override_mode(OverrideMode::On), None);
        assert!(h.is_running());
        // Timestamps wait for real feedback.
        assert_eq!(h.last_on(), None);
    }

    #[test]
    fn override_suppresses_demand_logic() {
        let mut h = heater(30.0);
        h.set_override_mode(OverrideMode::Off);
        assert_eq!(h.apply_heat_demand(100.0, at(0)).command, None);
        assert!(!h.is_running());

        h.set_override_mode(OverrideMode::On);
        h.confirm_actuator_state(true, at(1));
        assert_eq!(h.apply_heat_demand(0.0, at(10_000)).command, None);
    }

    #[test]
    fn override_bypasses_anti_cycle_window() {
        let mut h = heater(30.0);
        h.confirm_actuator_state(true, at(0));
        h.confirm_actuator_state(false, at(10));
        assert_eq!(h.set_override_mode(OverrideMode::On), on());
    }

    #[test]
    fn auto_resumes_from_confirmed_state() {
        let mut h = heater(30.0);
        h.set_override_mode(OverrideMode::On);
        assert!(h.is_running());
        assert_eq!(h.set_override_mode(OverrideMode::Auto), None);
        // Forced command never confirmed: back to the real state.
        assert!(!h.is_running());
        assert_eq!(h.apply_heat_demand(50.0, at(0)).command, on());
    }

    #[test]
    fn forced_stop_feeds_min_off_window() {
        let mut h = heater(30.0);
        h.confirm_actuator_state(true, at(0));
        h.set_override_mode(OverrideMode::Off);
        h.confirm_actuator_state(false, at(1_000));
        h.set_override_mode(OverrideMode::Auto);

        assert_eq!(h.apply_heat_demand(90.0, at(1_100)).command, None);
        assert_eq!(h.apply_heat_demand(90.0, at(1_300)).command, on());
    }

    #[test]
    fn override_mode_parses() {
        assert_eq!("AUTO".parse::<OverrideMode>(), Ok(OverrideMode::Auto));
        assert_eq!(" on ".parse::<OverrideMode>(), Ok(OverrideMode::On));
        assert_eq!(
            "boost".parse::<OverrideMode>(),
            Err(CommandError::InvalidMode("boost".into()))
        );
    }

    // -- Threshold --------------------------------------------------------

    #[test]
    fn threshold_clamped() {
        let mut h = heater(0.0);
        h.set_threshold(150.0).unwrap();
        assert_eq!(h.threshold(), 100.0);
        h.set_threshold(-5.0).unwrap();
        assert_eq!(h.threshold(), 0.0);
        assert!(h.set_threshold(f64::NAN).is_err());
    }

    // -- Snapshot ---------------------------------------------------------

    #[test]
    fn snapshot_restores_all_fields() {
        let mut h = heater(25.0);
        h.apply_heat_demand(60.0, at(0));
        h.confirm_actuator_state(true, at(0));
        h.confirm_actuator_state(false, at(400));
        h.set_override_mode(OverrideMode::Off);

        let snap = h.snapshot();
        let mut restored = HeaterController::new(h.config().clone());
        restored.restore(&snap);

        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.override_mode(), OverrideMode::Off);
        assert_eq!(restored.cycles(), 1);
        assert_eq!(restored.runtime_s(at(1_000)), 400.0);
    }
}
