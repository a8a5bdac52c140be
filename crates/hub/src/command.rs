//! Outbound actuator commands. The decision engine only produces these; the
//! controller task hands them to MQTT and never waits for an answer.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Turn a switch actuator (the heat source) on or off.
    SetSwitch { entity: String, on: bool },
    /// Move a room's climate actuator to a new setpoint.
    SetClimateTarget { entity: String, temperature: f64 },
}

impl Command {
    pub fn switch(entity: &str, on: bool) -> Self {
        Self::SetSwitch {
            entity: entity.to_string(),
            on,
        }
    }

    pub fn climate(entity: &str, temperature: f64) -> Self {
        Self::SetClimateTarget {
            entity: entity.to_string(),
            temperature,
        }
    }

    pub fn entity(&self) -> &str {
        match self {
            Self::SetSwitch { entity, .. } | Self::SetClimateTarget { entity, .. } => entity,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetSwitch { entity, on } => {
                write!(f, "{entity} -> {}", if *on { "ON" } else { "OFF" })
            }
            Self::SetClimateTarget {
                entity,
                temperature,
            } => write!(f, "{entity} -> {temperature:.1}°C"),
        }
    }
}
