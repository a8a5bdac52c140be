mod command;
mod config;
mod controller;
mod db;
mod error;
mod heater;
mod mqtt;
mod orchestrator;
mod preset;
mod room;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use controller::{Controller, Input, INPUT_QUEUE};
use db::Db;
use mqtt::{extract_entity_id, parse_state_payload, STATE_SUBSCRIPTION};
use orchestrator::Orchestrator;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:radiator.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed rooms + presets) ──────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // Rooms and presets from the DB are the source of truth.
    let rooms = db.load_rooms().await?;
    if rooms.is_empty() {
        warn!("no rooms configured in the database");
    }
    let presets = db.load_presets().await?;
    let snapshot = db.load_snapshot().await?;

    info!(
        rooms = rooms.len(),
        presets = presets.len(),
        heater = %cfg.heater.entity,
        "db ready"
    );

    let mut orch = Orchestrator::new(cfg.heater.clone(), rooms, presets);
    orch.load(&snapshot);

    // ── Shared state (ephemeral, for the web UI) ────────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("radiator-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Controller (single writer) ──────────────────────────────────
    let (inputs, rx) = mpsc::channel::<Input>(INPUT_QUEUE);
    tokio::spawn(Controller::new(orch, db, client.clone(), shared.clone()).run(rx));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: shared.clone(),
        inputs: inputs.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── MQTT loop ───────────────────────────────────────────────────
    client.subscribe(STATE_SUBSCRIPTION, QoS::AtLeastOnce).await?;
    info!(topic = STATE_SUBSCRIPTION, "hub subscribed");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(entity) = extract_entity_id(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                let input = Input::Entity {
                    entity: entity.to_string(),
                    update: parse_state_payload(&p.payload),
                };
                if inputs.send(input).await.is_err() {
                    error!("controller stopped, shutting down");
                    return Ok(());
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
