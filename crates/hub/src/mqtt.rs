use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;

use crate::command::Command;
use crate::orchestrator::EntityUpdate;

pub(crate) const STATE_SUBSCRIPTION: &str = "state/+";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct Attributes {
    temperature: Option<f64>,
    min_temp: Option<f64>,
    max_temp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StateMsg {
    state: serde_json::Value,
    #[serde(default)]
    attributes: Attributes,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract entity_id from "state/<entity_id>".
pub(crate) fn extract_entity_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 2 && parts[0] == "state" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Decode a state payload. JSON objects carry `state` plus optional climate
/// attributes; anything else is taken verbatim as the state string.
pub(crate) fn parse_state_payload(payload: &[u8]) -> EntityUpdate {
    let text = String::from_utf8_lossy(payload);
    match serde_json::from_str::<StateMsg>(&text) {
        Ok(msg) => EntityUpdate {
            state: match msg.state {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            },
            setpoint: msg.attributes.temperature,
            min_temp: msg.attributes.min_temp,
            max_temp: msg.attributes.max_temp,
        },
        Err(_) => EntityUpdate::state(text.trim()),
    }
}

/// Parse an "on"/"off" switch state (case-insensitive, trims whitespace).
pub(crate) fn parse_switch_state(state: &str) -> Option<bool> {
    match state.trim().to_ascii_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn command_topic(cmd: &Command) -> String {
    format!("cmd/{}/set", cmd.entity())
}

pub(crate) fn command_payload(cmd: &Command) -> String {
    match cmd {
        Command::SetSwitch { on: true, .. } => "ON".to_string(),
        Command::SetSwitch { on: false, .. } => "OFF".to_string(),
        Command::SetClimateTarget { temperature, .. } => format!("{temperature:.1}"),
    }
}

/// Queue a command without waiting for the broker. Fails only when the
/// client's request buffer is full or closed.
pub(crate) fn publish_command(
    client: &AsyncClient,
    cmd: &Command,
) -> Result<(), rumqttc::ClientError> {
    client.try_publish(command_topic(cmd), QoS::AtLeastOnce, false, command_payload(cmd))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- extract_entity_id --------------------------------------------------

    #[test]
    fn extract_entity_id_valid_topic() {
        assert_eq!(extract_entity_id("state/sensor.bedroom_temp"), Some("sensor.bedroom_temp"));
    }

    #[test]
    fn extract_entity_id_wrong_prefix() {
        assert_eq!(extract_entity_id("cmd/switch.boiler"), None);
    }

    #[test]
    fn extract_entity_id_too_many_segments() {
        assert_eq!(extract_entity_id("state/switch.boiler/set"), None);
    }

    #[test]
    fn extract_entity_id_empty() {
        assert_eq!(extract_entity_id("state/"), None);
        assert_eq!(extract_entity_id(""), None);
    }

    // -- parse_state_payload ------------------------------------------------

    #[test]
    fn bare_payload_is_the_state() {
        assert_eq!(parse_state_payload(b" 20.5\n"), EntityUpdate::state("20.5"));
        assert_eq!(parse_state_payload(b"unavailable"), EntityUpdate::state("unavailable"));
    }

    #[test]
    fn json_payload_with_climate_attributes() {
        let json = br#"{"state":"heat","attributes":{"temperature":21.5,"min_temp":7,"max_temp":28}}"#;
        let update = parse_state_payload(json);
        assert_eq!(update.state, "heat");
        assert_eq!(update.setpoint, Some(21.5));
        assert_eq!(update.min_temp, Some(7.0));
        assert_eq!(update.max_temp, Some(28.0));
    }

    #[test]
    fn json_numeric_state_kept_as_text() {
        let update = parse_state_payload(br#"{"state":19.8}"#);
        assert_eq!(update, EntityUpdate::state("19.8"));
    }

    #[test]
    fn json_without_state_falls_back_to_raw() {
        let update = parse_state_payload(br#"{"value":1}"#);
        assert_eq!(update.state, r#"{"value":1}"#);
    }

    // -- switch state -------------------------------------------------------

    #[test]
    fn parse_switch_state_variants() {
        assert_eq!(parse_switch_state("on"), Some(true));
        assert_eq!(parse_switch_state(" OFF "), Some(false));
        assert_eq!(parse_switch_state("unavailable"), None);
        assert_eq!(parse_switch_state(""), None);
    }

    // -- outbound -----------------------------------------------------------

    #[test]
    fn switch_command_encoding() {
        let cmd = Command::switch("switch.boiler", true);
        assert_eq!(command_topic(&cmd), "cmd/switch.boiler/set");
        assert_eq!(command_payload(&cmd), "ON");
        assert_eq!(command_payload(&Command::switch("switch.boiler", false)), "OFF");
    }

    #[test]
    fn climate_command_encoding() {
        let cmd = Command::climate("climate.bedroom_trv", 28.0);
        assert_eq!(command_topic(&cmd), "cmd/climate.bedroom_trv/set");
        assert_eq!(command_payload(&cmd), "28.0");
    }
}
