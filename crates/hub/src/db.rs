use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::warn;

use crate::heater::{HeaterSnapshot, OverrideMode};
use crate::orchestrator::Snapshot;
use crate::preset::Preset;
use crate::room::{RoomConfig, RoomSnapshot};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

type HeaterRow = (bool, Option<i64>, Option<i64>, f64, f64, String, i64, f64);

/// Heater timestamps are stored as unix nanoseconds.
fn to_unix_nanos(ts: Option<OffsetDateTime>) -> Option<i64> {
    ts.and_then(|t| i64::try_from(t.unix_timestamp_nanos()).ok())
}

fn from_unix_nanos(nanos: Option<i64>) -> Option<OffsetDateTime> {
    nanos.and_then(|n| OffsetDateTime::from_unix_timestamp_nanos(i128::from(n)).ok())
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/radiator/radiator.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Each in-memory connection is its own database.
        let in_memory = db_url.contains(":memory:");
        let mut pool = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool = pool
                .idle_timeout(None::<std::time::Duration>)
                .max_lifetime(None::<std::time::Duration>);
        }

        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Room config
    // ----------------------------

    pub async fn upsert_room(&self, r: &RoomConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rooms (name, temperature_sensor, humidity_sensor, climate_entity, hysteresis)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              temperature_sensor=excluded.temperature_sensor,
              humidity_sensor=excluded.humidity_sensor,
              climate_entity=excluded.climate_entity,
              hysteresis=excluded.hysteresis
            "#,
        )
        .bind(&r.name)
        .bind(&r.temperature_sensor)
        .bind(&r.humidity_sensor)
        .bind(&r.climate_entity)
        .bind(r.hysteresis)
        .execute(&self.pool)
        .await
        .context("upsert_room failed")?;
        Ok(())
    }

    pub async fn load_rooms(&self) -> Result<Vec<RoomConfig>> {
        let rows: Vec<(String, String, Option<String>, Option<String>, f64)> = sqlx::query_as(
            r#"
            SELECT name, temperature_sensor, humidity_sensor, climate_entity, hysteresis
            FROM rooms
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_rooms failed")?;

        Ok(rows
            .into_iter()
            .map(
                |(name, temperature_sensor, humidity_sensor, climate_entity, hysteresis)| {
                    RoomConfig {
                        name,
                        temperature_sensor,
                        humidity_sensor,
                        climate_entity,
                        hysteresis,
                    }
                },
            )
            .collect())
    }

    /// Removes the room and its runtime state. Preset overrides are left to
    /// the caller, which rewrites the affected presets.
    pub async fn delete_room(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("delete_room: begin failed")?;
        sqlx::query("DELETE FROM rooms WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .context("delete_room failed")?;
        sqlx::query("DELETE FROM room_state WHERE room_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .context("delete_room: room_state cleanup failed")?;
        tx.commit().await.context("delete_room: commit failed")?;
        Ok(())
    }

    // ----------------------------
    // Presets
    // ----------------------------

    /// Insert or replace a preset. The override map is replaced wholesale.
    pub async fn upsert_preset(&self, p: &Preset) -> Result<()> {
        let mut tx = self.pool.begin().await.context("upsert_preset: begin failed")?;
        sqlx::query(
            r#"
            INSERT INTO presets (name, default_temperature) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET default_temperature=excluded.default_temperature
            "#,
        )
        .bind(&p.name)
        .bind(p.default_temperature)
        .execute(&mut *tx)
        .await
        .context("upsert_preset failed")?;

        sqlx::query("DELETE FROM preset_overrides WHERE preset_name = ?")
            .bind(&p.name)
            .execute(&mut *tx)
            .await
            .context("upsert_preset: clearing overrides failed")?;

        for (room, t) in &p.overrides {
            sqlx::query(
                "INSERT INTO preset_overrides (preset_name, room_name, temperature) VALUES (?, ?, ?)",
            )
            .bind(&p.name)
            .bind(room)
            .bind(*t)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upsert_preset: override for '{room}' failed"))?;
        }

        tx.commit().await.context("upsert_preset: commit failed")?;
        Ok(())
    }

    pub async fn load_presets(&self) -> Result<Vec<Preset>> {
        let presets: Vec<(String, f64)> =
            sqlx::query_as("SELECT name, default_temperature FROM presets ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .context("load_presets failed")?;
        let overrides: Vec<(String, String, f64)> =
            sqlx::query_as("SELECT preset_name, room_name, temperature FROM preset_overrides")
                .fetch_all(&self.pool)
                .await
                .context("load_presets: overrides failed")?;

        let mut by_name: BTreeMap<String, Preset> = presets
            .into_iter()
            .map(|(name, t)| (name.clone(), Preset::new(&name, t)))
            .collect();
        for (preset, room, t) in overrides {
            if let Some(p) = by_name.get_mut(&preset) {
                p.overrides.insert(room, t);
            }
        }
        Ok(by_name.into_values().collect())
    }

    pub async fn delete_preset(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM presets WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .context("delete_preset failed")?;
        Ok(())
    }

    pub async fn count_rooms(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rooms")
            .fetch_one(&self.pool)
            .await
            .context("count_rooms failed")?;
        Ok(n)
    }

    pub async fn count_presets(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM presets")
            .fetch_one(&self.pool)
            .await
            .context("count_presets failed")?;
        Ok(n)
    }

    // ----------------------------
    // Runtime snapshot
    // ----------------------------

    pub async fn save_snapshot(&self, s: &Snapshot) -> Result<()> {
        let h = &s.heater;
        let mut tx = self.pool.begin().await.context("save_snapshot: begin failed")?;

        sqlx::query(
            r#"
            INSERT INTO heater_state (
              id, is_running, last_on, last_off,
              heat_demand, threshold_heat_demand, override_mode,
              cycles, total_runtime_s
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              is_running=excluded.is_running,
              last_on=excluded.last_on,
              last_off=excluded.last_off,
              heat_demand=excluded.heat_demand,
              threshold_heat_demand=excluded.threshold_heat_demand,
              override_mode=excluded.override_mode,
              cycles=excluded.cycles,
              total_runtime_s=excluded.total_runtime_s
            "#,
        )
        .bind(h.is_running)
        .bind(to_unix_nanos(h.last_on))
        .bind(to_unix_nanos(h.last_off))
        .bind(h.heat_demand)
        .bind(h.threshold_heat_demand)
        .bind(h.override_mode.as_str())
        .bind(i64::try_from(h.cycles).unwrap_or(i64::MAX))
        .bind(h.total_runtime_s)
        .execute(&mut *tx)
        .await
        .context("save_snapshot: heater_state failed")?;

        sqlx::query("DELETE FROM room_state")
            .execute(&mut *tx)
            .await
            .context("save_snapshot: clearing room_state failed")?;
        for (name, r) in &s.rooms {
            sqlx::query(
                "INSERT INTO room_state (room_name, target_temp, active_preset) VALUES (?, ?, ?)",
            )
            .bind(name)
            .bind(r.target_temp)
            .bind(&r.active_preset)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save_snapshot: room_state for '{name}' failed"))?;
        }

        tx.commit().await.context("save_snapshot: commit failed")?;
        Ok(())
    }

    /// Missing rows load as defaults.
    pub async fn load_snapshot(&self) -> Result<Snapshot> {
        let heater: Option<HeaterRow> = sqlx::query_as(
            r#"
            SELECT is_running, last_on, last_off,
                   heat_demand, threshold_heat_demand, override_mode,
                   cycles, total_runtime_s
            FROM heater_state
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("load_snapshot: heater_state failed")?;

        let heater = match heater {
            Some(row) => {
                let (is_running, last_on, last_off, heat_demand, threshold, mode, cycles, runtime) =
                    row;
                HeaterSnapshot {
                    is_running,
                    last_on: from_unix_nanos(last_on),
                    last_off: from_unix_nanos(last_off),
                    heat_demand,
                    threshold_heat_demand: threshold,
                    override_mode: OverrideMode::from_str(&mode).unwrap_or_else(|_| {
                        warn!(
                            mode = %mode,
                            "unknown persisted override mode, falling back to auto"
                        );
                        OverrideMode::Auto
                    }),
                    cycles: u64::try_from(cycles).unwrap_or(0),
                    total_runtime_s: runtime,
                }
            }
            None => HeaterSnapshot::default(),
        };

        let rooms: Vec<(String, Option<f64>, Option<String>)> =
            sqlx::query_as("SELECT room_name, target_temp, active_preset FROM room_state")
                .fetch_all(&self.pool)
                .await
                .context("load_snapshot: room_state failed")?;

        Ok(Snapshot {
            heater,
            rooms: rooms
                .into_iter()
                .map(|(name, target_temp, active_preset)| {
                    (name, RoomSnapshot { target_temp, active_preset })
                })
                .collect(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
