//! SQLite-backed store. Timestamps are stored as fixed-width RFC 3339 text so lexical
//! order matches chronological order.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use invsync_core::{
    ChangeLogEntry, ChangeType, InventoryRecord, MonitorConfig, PageScope, Price, PricePoint,
    RecordAttributes, RunCounters, RunRecord, RunStatus, RunTrigger,
};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    page_count, page_window, stale_run_failed, AppendOutcome, ApplyBatch, ApplyCounts,
    InventoryStore, RunAdmission, RunPage, StoreError,
};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url` and applies pending migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its connection.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(30))
        };
        let pool = pool_opts.connect_with(opts).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(url, "sqlite store ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp `{raw}`: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("run id `{raw}`: {e}")))
}

fn parse_enum<T: FromStr>(raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn record_from_row(row: &SqliteRow) -> Result<InventoryRecord, StoreError> {
    Ok(InventoryRecord {
        identifier: row.try_get("identifier")?,
        price: row.try_get::<Option<i64>, _>("price_cents")?.map(Price::from_cents),
        attributes: RecordAttributes {
            stock_number: row.try_get("stock_number")?,
            year: row.try_get("model_year")?,
            make: row.try_get("make")?,
            model: row.try_get("model")?,
            trim: row.try_get("trim_level")?,
            category: row.try_get("category")?,
            mileage: row.try_get("mileage")?,
            exterior_color: row.try_get("exterior_color")?,
            interior_color: row.try_get("interior_color")?,
            drivetrain: row.try_get("drivetrain")?,
            engine: row.try_get("engine")?,
            transmission: row.try_get("transmission")?,
            detail_url: row.try_get("detail_url")?,
        },
        active: row.try_get("active")?,
        first_seen: parse_ts(&row.try_get::<String, _>("first_seen")?)?,
        last_updated: parse_ts(&row.try_get::<String, _>("last_updated")?)?,
    })
}

fn change_from_row(row: &SqliteRow) -> Result<ChangeLogEntry, StoreError> {
    Ok(ChangeLogEntry {
        identifier: row.try_get("identifier")?,
        change_type: parse_enum::<ChangeType>(&row.try_get::<String, _>("change_type")?)?,
        field_name: row.try_get("field_name")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        changed_at: parse_ts(&row.try_get::<String, _>("changed_at")?)?,
        run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
        dedupe_key: row.try_get("dedupe_key")?,
    })
}

fn price_from_row(row: &SqliteRow) -> Result<PricePoint, StoreError> {
    let run_id: Option<String> = row.try_get("run_id")?;
    Ok(PricePoint {
        identifier: row.try_get("identifier")?,
        price: Price::from_cents(row.try_get("price_cents")?),
        recorded_at: parse_ts(&row.try_get::<String, _>("recorded_at")?)?,
        source: row.try_get("source")?,
        run_id: run_id.as_deref().map(parse_uuid).transpose()?,
        dedupe_key: row.try_get("dedupe_key")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord, StoreError> {
    let errors_json: String = row.try_get("errors_json")?;
    let count = |column: &str| -> Result<u64, StoreError> {
        Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
    };
    Ok(RunRecord {
        run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
        trigger: parse_enum::<RunTrigger>(&row.try_get::<String, _>("run_trigger")?)?,
        scope: PageScope::first(row.try_get::<i64, _>("scope_pages")?.max(0) as u32),
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
        status: parse_enum::<RunStatus>(&row.try_get::<String, _>("status")?)?,
        counters: RunCounters {
            found: count("found")?,
            new: count("new_count")?,
            updated: count("updated_count")?,
            removed: count("removed_count")?,
        },
        errors: serde_json::from_str(&errors_json)?,
        log: row.try_get("log")?,
        partial: row.try_get("partial")?,
    })
}

const UPSERT_RECORD: &str = r#"
INSERT INTO inventory_records
  (identifier, price_cents, stock_number, model_year, make, model, trim_level, category,
   mileage, exterior_color, interior_color, drivetrain, engine, transmission, detail_url,
   active, first_seen, last_updated)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
ON CONFLICT(identifier) DO UPDATE SET
  price_cents = excluded.price_cents,
  stock_number = excluded.stock_number,
  model_year = excluded.model_year,
  make = excluded.make,
  model = excluded.model,
  trim_level = excluded.trim_level,
  category = excluded.category,
  mileage = excluded.mileage,
  exterior_color = excluded.exterior_color,
  interior_color = excluded.interior_color,
  drivetrain = excluded.drivetrain,
  engine = excluded.engine,
  transmission = excluded.transmission,
  detail_url = excluded.detail_url,
  active = excluded.active,
  last_updated = excluded.last_updated
"#;

const SAVE_RUN: &str = r#"
UPDATE sync_runs SET
  finished_at = ?2, status = ?3, found = ?4, new_count = ?5, updated_count = ?6,
  removed_count = ?7, errors_json = ?8, log = ?9, partial = ?10
WHERE run_id = ?1
"#;

/// Binds `?1..=?10` of [`SAVE_RUN`].
fn bind_run_outcome<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    run: &'q RunRecord,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, StoreError> {
    Ok(query
        .bind(run.run_id.to_string())
        .bind(run.finished_at.map(ts))
        .bind(run.status.as_str())
        .bind(run.counters.found as i64)
        .bind(run.counters.new as i64)
        .bind(run.counters.updated as i64)
        .bind(run.counters.removed as i64)
        .bind(serde_json::to_string(&run.errors)?)
        .bind(&run.log)
        .bind(run.partial))
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn load_records(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM inventory_records ORDER BY identifier")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_record(&self, identifier: &str) -> Result<Option<InventoryRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM inventory_records WHERE identifier = ?1")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn apply_batch(&self, batch: &ApplyBatch) -> Result<ApplyCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut counts = ApplyCounts::default();

        for record in &batch.upserts {
            let attrs = &record.attributes;
            sqlx::query(UPSERT_RECORD)
                .bind(&record.identifier)
                .bind(record.price.map(Price::cents))
                .bind(&attrs.stock_number)
                .bind(attrs.year)
                .bind(&attrs.make)
                .bind(&attrs.model)
                .bind(&attrs.trim)
                .bind(&attrs.category)
                .bind(attrs.mileage)
                .bind(&attrs.exterior_color)
                .bind(&attrs.interior_color)
                .bind(&attrs.drivetrain)
                .bind(&attrs.engine)
                .bind(&attrs.transmission)
                .bind(&attrs.detail_url)
                .bind(record.active)
                .bind(ts(record.first_seen))
                .bind(ts(record.last_updated))
                .execute(&mut *tx)
                .await?;
            counts.upserted += 1;
        }

        for identifier in &batch.archive {
            let result = sqlx::query(
                "UPDATE inventory_records SET active = 0, last_updated = ?2 WHERE identifier = ?1 AND active = 1",
            )
            .bind(identifier)
            .bind(ts(batch.at))
            .execute(&mut *tx)
            .await?;
            counts.archived += result.rows_affected();
        }

        tx.commit().await?;
        debug!(upserted = counts.upserted, archived = counts.archived, "apply batch committed");
        Ok(counts)
    }

    async fn insert_change_entry(&self, entry: &ChangeLogEntry) -> Result<AppendOutcome, StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO change_log
  (identifier, change_type, field_name, old_value, new_value, changed_at, run_id, dedupe_key)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(dedupe_key) DO NOTHING
"#,
        )
        .bind(&entry.identifier)
        .bind(entry.change_type.as_str())
        .bind(&entry.field_name)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(ts(entry.changed_at))
        .bind(entry.run_id.to_string())
        .bind(&entry.dedupe_key)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 0 {
            AppendOutcome::Duplicate
        } else {
            AppendOutcome::Inserted
        })
    }

    async fn append_price_point(&self, point: &PricePoint) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let seen: Option<i64> = sqlx::query_scalar("SELECT id FROM price_history WHERE dedupe_key = ?1")
            .bind(&point.dedupe_key)
            .fetch_optional(&mut *tx)
            .await?;
        if seen.is_some() {
            return Ok(AppendOutcome::Duplicate);
        }

        let latest = sqlx::query(
            "SELECT price_cents, recorded_at FROM price_history WHERE identifier = ?1 ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(&point.identifier)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = latest {
            let cents: i64 = row.try_get("price_cents")?;
            let recorded_at = parse_ts(&row.try_get::<String, _>("recorded_at")?)?;
            if cents == point.price.cents() {
                return Ok(AppendOutcome::Duplicate);
            }
            if recorded_at > point.recorded_at {
                return Err(StoreError::NonMonotonic {
                    identifier: point.identifier.clone(),
                });
            }
        }

        let result = sqlx::query(
            r#"
INSERT INTO price_history (identifier, price_cents, recorded_at, source, run_id, dedupe_key)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(dedupe_key) DO NOTHING
"#,
        )
        .bind(&point.identifier)
        .bind(point.price.cents())
        .bind(ts(point.recorded_at))
        .bind(&point.source)
        .bind(point.run_id.map(|id| id.to_string()))
        .bind(&point.dedupe_key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if result.rows_affected() == 0 {
            AppendOutcome::Duplicate
        } else {
            AppendOutcome::Inserted
        })
    }

    async fn price_history(&self, identifier: &str) -> Result<Vec<PricePoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM price_history WHERE identifier = ?1 ORDER BY recorded_at ASC, id ASC",
        )
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_from_row).collect()
    }

    async fn change_history(&self, identifier: &str) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM change_log WHERE identifier = ?1 ORDER BY changed_at DESC, id DESC",
        )
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(change_from_row).collect()
    }

    async fn create_run(&self, run: &RunRecord, lease_cutoff: DateTime<Utc>) -> Result<RunAdmission, StoreError> {
        // One statement, so the live-lease check and the insert cannot interleave with
        // another process doing the same.
        for _ in 0..2 {
            let inserted = sqlx::query(
                r#"
INSERT INTO sync_runs
  (run_id, run_trigger, scope_pages, started_at, status, errors_json, log, partial, lease_renewed_at)
SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?4
WHERE NOT EXISTS (
  SELECT 1 FROM sync_runs WHERE status = 'running' AND lease_renewed_at >= ?9
)
"#,
            )
            .bind(run.run_id.to_string())
            .bind(run.trigger.as_str())
            .bind(i64::from(run.scope.pages))
            .bind(ts(run.started_at))
            .bind(run.status.as_str())
            .bind(serde_json::to_string(&run.errors)?)
            .bind(&run.log)
            .bind(run.partial)
            .bind(ts(lease_cutoff))
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 1 {
                return Ok(RunAdmission::Admitted);
            }

            let holder: Option<String> = sqlx::query_scalar(
                r#"
SELECT run_id FROM sync_runs
WHERE status = 'running' AND lease_renewed_at >= ?1
ORDER BY lease_renewed_at DESC LIMIT 1
"#,
            )
            .bind(ts(lease_cutoff))
            .fetch_optional(&self.pool)
            .await?;
            if let Some(holder) = holder {
                debug!(run_id = %run.run_id, holder = %holder, "run lease held elsewhere");
                return Ok(RunAdmission::Busy {
                    run_id: parse_uuid(&holder)?,
                });
            }
            // The holder finished between the two statements; try once more.
        }
        Err(StoreError::Unavailable(format!(
            "could not admit run {}: the run lease kept changing hands",
            run.run_id
        )))
    }

    async fn renew_run_lease(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_runs SET lease_renewed_at = ?2 WHERE run_id = ?1 AND status = 'running'",
        )
        .bind(run_id.to_string())
        .bind(ts(at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<bool, StoreError> {
        let query = format!("{SAVE_RUN} AND status = 'running'");
        let result = bind_run_outcome(sqlx::query(&query), run)?
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_finished_runs(&self, page: u32, per_page: u32) -> Result<RunPage, StoreError> {
        let (page, per_page, offset) = page_window(page, per_page);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_runs WHERE status != 'running'")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(
            "SELECT * FROM sync_runs WHERE status != 'running' ORDER BY started_at DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(i64::from(per_page))
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        let items = rows.iter().map(run_from_row).collect::<Result<Vec<_>, _>>()?;
        let total = total.max(0) as u64;
        Ok(RunPage {
            items,
            total,
            page,
            per_page,
            pages: page_count(total, per_page),
        })
    }

    async fn fail_stale_runs(
        &self,
        note: &str,
        lease_cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = ts(lease_cutoff);
        let rows = sqlx::query(
            "SELECT * FROM sync_runs WHERE status = 'running' AND (lease_renewed_at IS NULL OR lease_renewed_at < ?1)",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;
        let mut failed = 0;
        for row in &rows {
            let mut run = run_from_row(row)?;
            stale_run_failed(&mut run, note, at);
            // Re-checks the lease so a run renewed since the select is left alone.
            let query = format!(
                "{SAVE_RUN} AND status = 'running' AND (lease_renewed_at IS NULL OR lease_renewed_at < ?11)"
            );
            let result = bind_run_outcome(sqlx::query(&query), &run)?
                .bind(&cutoff)
                .execute(&self.pool)
                .await?;
            failed += result.rows_affected();
        }
        Ok(failed)
    }

    async fn load_monitor_config(&self) -> Result<MonitorConfig, StoreError> {
        let row = sqlx::query("SELECT * FROM monitor_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(MonitorConfig::default());
        };
        Ok(MonitorConfig {
            enabled: row.try_get("enabled")?,
            interval_minutes: row.try_get::<i64, _>("interval_minutes")?.max(0) as u32,
            pages: row.try_get::<i64, _>("pages")?.max(0) as u32,
            last_check_at: parse_opt_ts(row.try_get("last_check_at")?)?,
            last_check_result: row.try_get("last_check_result")?,
        })
    }

    async fn save_monitor_settings(&self, config: &MonitorConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO monitor_config (id, enabled, interval_minutes, pages) VALUES (1, ?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET
  enabled = excluded.enabled,
  interval_minutes = excluded.interval_minutes,
  pages = excluded.pages
"#,
        )
        .bind(config.enabled)
        .bind(i64::from(config.interval_minutes))
        .bind(i64::from(config.pages))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_monitor_check(&self, at: DateTime<Utc>, outcome: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO monitor_config (id, last_check_at, last_check_result) VALUES (1, ?1, ?2)
ON CONFLICT(id) DO UPDATE SET
  last_check_at = excluded.last_check_at,
  last_check_result = excluded.last_check_result
"#,
        )
        .bind(ts(at))
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
