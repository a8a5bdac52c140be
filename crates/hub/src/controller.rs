//! Controller task: the single writer for the orchestrator.
//!
//! Every input (host entity states from MQTT, user commands from the web
//! API) arrives on one mpsc channel and is applied in arrival order. After
//! each settled event the controller
//!
//! 1. hands the resulting actuator commands to MQTT (fire-and-forget),
//! 2. persists the runtime snapshot if the orchestrator signalled a change,
//! 3. refreshes the read model the web UI serves.

use anyhow::Result;
use rumqttc::AsyncClient;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::error::CommandError;
use crate::heater::OverrideMode;
use crate::mqtt::{parse_switch_state, publish_command};
use crate::orchestrator::{EntityUpdate, Orchestrator, Outcome};
use crate::preset::Preset;
use crate::room::RoomConfig;
use crate::state::SharedState;

/// Capacity of the controller's input queue.
pub const INPUT_QUEUE: usize = 64;

pub type Reply = oneshot::Sender<Result<(), CommandError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    SetTarget { room: String, temperature: f64 },
    SetRoomPreset { room: String, preset: Option<String> },
    /// Global select: `none` clears every link, anything else applies.
    SelectPreset { option: String },
    SetOverrideMode { mode: OverrideMode },
    SetThreshold { value: f64 },
    AddRoom(RoomConfig),
    UpdateRoom { name: String, config: RoomConfig },
    RemoveRoom { name: String },
    AddPreset(Preset),
    UpdatePreset { name: String, preset: Preset },
    RemovePreset { name: String },
}

#[derive(Debug)]
pub enum Input {
    Entity { entity: String, update: EntityUpdate },
    Command { command: UserCommand, reply: Reply },
}

pub struct Controller {
    orch: Orchestrator,
    db: Db,
    mqtt: AsyncClient,
    shared: SharedState,
    revision: watch::Receiver<u64>,
}

impl Controller {
    pub fn new(orch: Orchestrator, db: Db, mqtt: AsyncClient, shared: SharedState) -> Self {
        let revision = orch.subscribe();
        Self {
            orch,
            db,
            mqtt,
            shared,
            revision,
        }
    }

    /// Run until every sender is dropped. Intended to be `tokio::spawn`-ed
    /// from main.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<Input>) {
        info!(
            rooms = self.orch.rooms().count(),
            heater = %self.orch.heater().entity(),
            "controller started"
        );
        self.publish_status(OffsetDateTime::now_utc()).await;

        while let Some(input) = inputs.recv().await {
            self.handle(input, OffsetDateTime::now_utc()).await;
        }
        info!("controller input closed, stopping");
    }

    async fn handle(&mut self, input: Input, now: OffsetDateTime) {
        match input {
            Input::Entity { entity, update } => {
                let outcome = self.orch.on_entity_state(&entity, &update, now);
                if outcome.changed {
                    let mut st = self.shared.write().await;
                    if entity == self.orch.heater().entity() {
                        if let Some(on) = parse_switch_state(&update.state) {
                            st.record_heater(on);
                        }
                    } else {
                        st.record_sensor(&entity, &update.state);
                    }
                }
                self.finish(outcome, now).await;
            }
            Input::Command { command, reply } => {
                debug!(?command, "user command");
                let result = self.execute(&command, now);
                let answer = match result {
                    Ok(outcome) => {
                        if let Err(e) = self.write_through(&command).await {
                            error!("controller: config write-through failed: {e:#}");
                            self.shared
                                .write()
                                .await
                                .record_error(format!("config write failed: {e}"));
                        }
                        self.finish(outcome, now).await;
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "user command rejected");
                        Err(e)
                    }
                };
                // The requester may have gone away; nothing to do then.
                let _ = reply.send(answer);
            }
        }
    }

    fn execute(
        &mut self,
        command: &UserCommand,
        now: OffsetDateTime,
    ) -> Result<Outcome, CommandError> {
        let orch = &mut self.orch;
        match command {
            UserCommand::SetTarget { room, temperature } => {
                orch.set_target_temperature(room, *temperature, now)
            }
            UserCommand::SetRoomPreset { room, preset } => {
                orch.set_room_preset(room, preset.as_deref(), now)
            }
            UserCommand::SelectPreset { option } => orch.select_global_preset(option, now),
            UserCommand::SetOverrideMode { mode } => Ok(orch.set_override_mode(*mode, now)),
            UserCommand::SetThreshold { value } => orch.set_threshold(*value, now),
            UserCommand::AddRoom(config) => orch.add_room(config.clone(), now),
            UserCommand::UpdateRoom { name, config } => orch.update_room(name, config.clone(), now),
            UserCommand::RemoveRoom { name } => orch.remove_room(name, now),
            UserCommand::AddPreset(preset) => orch.add_preset(preset.clone(), now),
            UserCommand::UpdatePreset { name, preset } => {
                orch.update_preset(name, preset.clone(), now)
            }
            UserCommand::RemovePreset { name } => orch.remove_preset(name, now),
        }
    }

    /// Persist a configuration change the orchestrator accepted.
    async fn write_through(&self, command: &UserCommand) -> Result<()> {
        let detail = match command {
            UserCommand::AddRoom(config) => {
                self.db.upsert_room(config).await?;
                format!("room '{}' added", config.name)
            }
            UserCommand::UpdateRoom { name, config } => {
                if *name != config.name {
                    self.db.delete_room(name).await?;
                    // Overrides were re-keyed to the new room name.
                    for preset in self.orch.presets().iter() {
                        self.db.upsert_preset(preset).await?;
                    }
                }
                self.db.upsert_room(config).await?;
                format!("room '{name}' updated")
            }
            UserCommand::RemoveRoom { name } => {
                self.db.delete_room(name).await?;
                format!("room '{name}' removed")
            }
            UserCommand::AddPreset(preset) => {
                self.db.upsert_preset(preset).await?;
                format!("preset '{}' added", preset.name)
            }
            UserCommand::UpdatePreset { name, preset } => {
                if *name != preset.name {
                    self.db.delete_preset(name).await?;
                }
                self.db.upsert_preset(preset).await?;
                format!("preset '{name}' updated")
            }
            UserCommand::RemovePreset { name } => {
                self.db.delete_preset(name).await?;
                format!("preset '{name}' removed")
            }
            _ => return Ok(()),
        };
        self.shared.write().await.record_config(detail);
        Ok(())
    }

    async fn finish(&mut self, outcome: Outcome, now: OffsetDateTime) {
        if !outcome.commands.is_empty() {
            let mut st = self.shared.write().await;
            for cmd in &outcome.commands {
                info!(command = %cmd, "dispatching actuator command");
                st.record_command(cmd);
                if let Err(e) = publish_command(&self.mqtt, cmd) {
                    error!(command = %cmd, "controller: publish failed: {e}");
                    st.record_error(format!("publish {cmd} failed: {e}"));
                }
            }
        }

        // One tick per changed event; skip the write otherwise.
        if !self.revision.has_changed().unwrap_or(false) {
            return;
        }
        self.revision.borrow_and_update();

        if let Err(e) = self.db.save_snapshot(&self.orch.snapshot()).await {
            error!("controller: save_snapshot failed: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("snapshot save failed: {e}"));
        }
        self.publish_status(now).await;
    }

    async fn publish_status(&self, now: OffsetDateTime) {
        let status = self.orch.status(now);
        self.shared.write().await.publish(status);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
