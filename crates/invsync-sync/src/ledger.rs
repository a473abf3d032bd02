//! Append-only audit trail: field-level change entries and price points.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use invsync_core::{ChangeLogEntry, ChangeType, Price, PricePoint};
use invsync_storage::{AppendOutcome, InventoryStore};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::compare::DiffResult;
use crate::error::LedgerWriteError;

pub const PRICE_SOURCE: &str = "scrape";
const ACTIVE_FIELD: &str = "is_active";

#[derive(Debug, Clone, Copy)]
pub struct LedgerContext {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LedgerReport {
    pub entries_written: usize,
    pub price_points_written: usize,
    pub duplicates: usize,
    pub errors: Vec<LedgerWriteError>,
}

impl LedgerReport {
    fn tally(&mut self, outcome: Result<AppendOutcome, LedgerWriteError>, price: bool) {
        match outcome {
            Ok(AppendOutcome::Inserted) if price => self.price_points_written += 1,
            Ok(AppendOutcome::Inserted) => self.entries_written += 1,
            Ok(AppendOutcome::Duplicate) => self.duplicates += 1,
            Err(err) => {
                warn!(identifier = %err.identifier, error = %err, "ledger write failed");
                self.errors.push(err);
            }
        }
    }
}

fn dedupe_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f_u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn change_entry_key(identifier: &str, change_type: ChangeType, field: Option<&str>, run_id: Uuid) -> String {
    dedupe_key(&[
        identifier,
        change_type.as_str(),
        field.unwrap_or(""),
        &run_id.to_string(),
    ])
}

/// Price points within the same hour at the same price collapse to one.
pub fn price_point_key(identifier: &str, at: DateTime<Utc>, price: Price) -> String {
    let bucket = at.format("%Y-%m-%dT%H").to_string();
    dedupe_key(&[identifier, &bucket, &price.cents().to_string()])
}

#[derive(Clone)]
pub struct ChangeLedger {
    store: Arc<dyn InventoryStore>,
}

impl ChangeLedger {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    /// Writes the audit trail for `diff`. Safe to repeat for the same run; a failure for one
    /// identifier never stops the others.
    pub async fn record(&self, diff: &DiffResult, ctx: &LedgerContext) -> LedgerReport {
        let mut report = LedgerReport::default();

        for changed in &diff.changed {
            for change in &changed.field_changes {
                let outcome = self
                    .record_field_change(
                        &changed.identifier,
                        Some(change.field.as_str()),
                        change.old.as_deref(),
                        change.new.as_deref(),
                        ChangeType::Updated,
                        ctx,
                    )
                    .await;
                report.tally(outcome, false);
            }
            if changed.price_change().is_some() {
                if let Some(price) = changed.remote.normalized_price() {
                    let outcome = self.record_price(&changed.identifier, price, ctx).await;
                    report.tally(outcome, true);
                }
            }
        }

        for added in &diff.new_remote {
            let identifier = added.identifier();
            let price = added.remote.normalized_price();
            let (outcome, wants_price) = if added.reactivated {
                let outcome = self
                    .record_field_change(
                        identifier,
                        Some(ACTIVE_FIELD),
                        Some("false"),
                        Some("true"),
                        ChangeType::Reactivated,
                        ctx,
                    )
                    .await;
                let archived_price = added.previous.as_ref().and_then(|p| p.price);
                (outcome, price.is_some() && price != archived_price)
            } else {
                let outcome = self
                    .record_field_change(identifier, None, None, None, ChangeType::New, ctx)
                    .await;
                (outcome, price.is_some())
            };
            report.tally(outcome, false);
            if let (true, Some(price)) = (wants_price, price) {
                let outcome = self.record_price(identifier, price, ctx).await;
                report.tally(outcome, true);
            }
        }

        for gone in &diff.gone_local {
            let outcome = self
                .record_field_change(
                    &gone.identifier,
                    Some(ACTIVE_FIELD),
                    Some("true"),
                    Some("false"),
                    ChangeType::Removed,
                    ctx,
                )
                .await;
            report.tally(outcome, false);
        }

        report
    }

    pub async fn record_field_change(
        &self,
        identifier: &str,
        field: Option<&str>,
        old: Option<&str>,
        new: Option<&str>,
        change_type: ChangeType,
        ctx: &LedgerContext,
    ) -> Result<AppendOutcome, LedgerWriteError> {
        let entry = ChangeLogEntry {
            identifier: identifier.to_string(),
            change_type,
            field_name: field.map(str::to_string),
            old_value: old.map(str::to_string),
            new_value: new.map(str::to_string),
            changed_at: ctx.recorded_at,
            run_id: ctx.run_id,
            dedupe_key: change_entry_key(identifier, change_type, field, ctx.run_id),
        };
        self.store
            .insert_change_entry(&entry)
            .await
            .map_err(|source| LedgerWriteError {
                identifier: identifier.to_string(),
                what: format!("{} {}", change_type.as_str(), field.unwrap_or("record")),
                source,
            })
    }

    async fn record_price(
        &self,
        identifier: &str,
        price: Price,
        ctx: &LedgerContext,
    ) -> Result<AppendOutcome, LedgerWriteError> {
        let point = PricePoint {
            identifier: identifier.to_string(),
            price,
            recorded_at: ctx.recorded_at,
            source: PRICE_SOURCE.to_string(),
            run_id: Some(ctx.run_id),
            dedupe_key: price_point_key(identifier, ctx.recorded_at, price),
        };
        self.store
            .append_price_point(&point)
            .await
            .map_err(|source| LedgerWriteError {
                identifier: identifier.to_string(),
                what: "price point".to_string(),
                source,
            })
    }
}
