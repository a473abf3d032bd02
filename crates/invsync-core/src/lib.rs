//! Core domain model for the inventory mirror: records, audit entries, runs and monitor settings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "invsync-core";

/// Canonical form of an external identifier (VIN-like): trimmed, ASCII upper-case.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Price in the canonical unit (whole cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(i64);

impl Price {
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Normalizes a parsed currency amount; non-finite and negative amounts are unknown.
    pub fn from_amount(amount: f64) -> Option<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return None;
        }
        Some(Self((amount * 100.0).round() as i64))
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn as_amount(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 100;
        let frac = self.0 % 100;
        if frac == 0 {
            write!(f, "{whole}")
        } else {
            write!(f, "{whole}.{frac:02}")
        }
    }
}

/// Descriptive attributes shared by remote snapshots and stored records.
/// `None` means "unknown", never "cleared".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAttributes {
    #[serde(default)]
    pub stock_number: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub mileage: Option<i64>,
    #[serde(default)]
    pub exterior_color: Option<String>,
    #[serde(default)]
    pub interior_color: Option<String>,
    #[serde(default)]
    pub drivetrain: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub transmission: Option<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
}

impl RecordAttributes {
    /// Overwrites every attribute the other side knows; unknown values keep what we had.
    pub fn merge_from(&mut self, other: &RecordAttributes) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if let Some(value) = src {
                *dst = Some(value.clone());
            }
        }
        take(&mut self.stock_number, &other.stock_number);
        take(&mut self.year, &other.year);
        take(&mut self.make, &other.make);
        take(&mut self.model, &other.model);
        take(&mut self.trim, &other.trim);
        take(&mut self.category, &other.category);
        take(&mut self.mileage, &other.mileage);
        take(&mut self.exterior_color, &other.exterior_color);
        take(&mut self.interior_color, &other.interior_color);
        take(&mut self.drivetrain, &other.drivetrain);
        take(&mut self.engine, &other.engine);
        take(&mut self.transmission, &other.transmission);
        take(&mut self.detail_url, &other.detail_url);
    }
}

/// One record as produced by the fetcher, already parsed into scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub identifier: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(flatten)]
    pub attributes: RecordAttributes,
}

impl RawRecord {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            price: None,
            attributes: RecordAttributes::default(),
        }
    }

    pub fn with_price(mut self, amount: f64) -> Self {
        self.price = Some(amount);
        self
    }

    pub fn normalized_price(&self) -> Option<Price> {
        self.price.and_then(Price::from_amount)
    }
}

/// Locally mirrored record. `active = false` marks an archived record; records are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub identifier: String,
    pub price: Option<Price>,
    #[serde(flatten)]
    pub attributes: RecordAttributes,
    pub active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl InventoryRecord {
    pub fn from_raw(raw: &RawRecord, at: DateTime<Utc>) -> Self {
        Self {
            identifier: normalize_identifier(&raw.identifier),
            price: raw.normalized_price(),
            attributes: raw.attributes.clone(),
            active: true,
            first_seen: at,
            last_updated: at,
        }
    }

    /// Folds a fresh remote observation into this record and marks it active.
    pub fn absorb(&mut self, raw: &RawRecord, at: DateTime<Utc>) {
        if let Some(price) = raw.normalized_price() {
            self.price = Some(price);
        }
        self.attributes.merge_from(&raw.attributes);
        self.active = true;
        self.last_updated = at;
    }
}

/// Tracked fields in comparison order: price first, then structural fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Price,
    Mileage,
    Year,
    Make,
    Model,
    Trim,
    Category,
    StockNumber,
    ExteriorColor,
    InteriorColor,
    Drivetrain,
    Engine,
    Transmission,
    DetailUrl,
}

impl TrackedField {
    pub const ALL: [TrackedField; 14] = [
        TrackedField::Price,
        TrackedField::Mileage,
        TrackedField::Year,
        TrackedField::Make,
        TrackedField::Model,
        TrackedField::Trim,
        TrackedField::Category,
        TrackedField::StockNumber,
        TrackedField::ExteriorColor,
        TrackedField::InteriorColor,
        TrackedField::Drivetrain,
        TrackedField::Engine,
        TrackedField::Transmission,
        TrackedField::DetailUrl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackedField::Price => "price",
            TrackedField::Mileage => "mileage",
            TrackedField::Year => "year",
            TrackedField::Make => "make",
            TrackedField::Model => "model",
            TrackedField::Trim => "trim",
            TrackedField::Category => "category",
            TrackedField::StockNumber => "stock_number",
            TrackedField::ExteriorColor => "exterior_color",
            TrackedField::InteriorColor => "interior_color",
            TrackedField::Drivetrain => "drivetrain",
            TrackedField::Engine => "engine",
            TrackedField::Transmission => "transmission",
            TrackedField::DetailUrl => "detail_url",
        }
    }

    /// Display form of this field's value, `None` when unknown.
    pub fn value_of(self, price: Option<Price>, attrs: &RecordAttributes) -> Option<String> {
        match self {
            TrackedField::Price => price.map(|p| p.to_string()),
            TrackedField::Mileage => attrs.mileage.map(|m| m.to_string()),
            TrackedField::Year => attrs.year.map(|y| y.to_string()),
            TrackedField::Make => attrs.make.clone(),
            TrackedField::Model => attrs.model.clone(),
            TrackedField::Trim => attrs.trim.clone(),
            TrackedField::Category => attrs.category.clone(),
            TrackedField::StockNumber => attrs.stock_number.clone(),
            TrackedField::ExteriorColor => attrs.exterior_color.clone(),
            TrackedField::InteriorColor => attrs.interior_color.clone(),
            TrackedField::Drivetrain => attrs.drivetrain.clone(),
            TrackedField::Engine => attrs.engine.clone(),
            TrackedField::Transmission => attrs.transmission.clone(),
            TrackedField::DetailUrl => attrs.detail_url.clone(),
        }
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    New,
    Updated,
    Removed,
    Reactivated,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::New => "new",
            ChangeType::Updated => "updated",
            ChangeType::Removed => "removed",
            ChangeType::Reactivated => "reactivated",
        }
    }
}

impl FromStr for ChangeType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ChangeType::New),
            "updated" => Ok(ChangeType::Updated),
            "removed" => Ok(ChangeType::Removed),
            "reactivated" => Ok(ChangeType::Reactivated),
            other => Err(ParseEnumError {
                kind: "change type",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable audit entry for one field transition of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub identifier: String,
    pub change_type: ChangeType,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub dedupe_key: String,
}

/// Immutable price observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub identifier: String,
    pub price: Price,
    pub recorded_at: DateTime<Utc>,
    pub source: String,
    pub run_id: Option<Uuid>,
    pub dedupe_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceDirection {
    Up,
    Down,
    Stable,
    New,
}

/// Direction and signed amount (in cents) between the two most recent points.
/// `points` must be in ascending time order.
pub fn price_direction(points: &[PricePoint]) -> (PriceDirection, Option<i64>) {
    match points {
        [] => (PriceDirection::Stable, None),
        [_] => (PriceDirection::New, None),
        [.., previous, latest] => {
            let diff = latest.price.cents() - previous.price.cents();
            if diff == 0 {
                (PriceDirection::Stable, Some(0))
            } else if diff > 0 {
                (PriceDirection::Up, Some(diff))
            } else {
                (PriceDirection::Down, Some(diff))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ParseEnumError {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Monitor,
    Scheduled,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Monitor => "monitor",
            RunTrigger::Scheduled => "scheduled",
        }
    }
}

impl FromStr for RunTrigger {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RunTrigger::Manual),
            "monitor" => Ok(RunTrigger::Monitor),
            "scheduled" => Ok(RunTrigger::Scheduled),
            other => Err(ParseEnumError {
                kind: "run trigger",
                value: other.to_string(),
            }),
        }
    }
}

/// Requested page range. `pages == 0` means every page until a terminal page is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageScope {
    pub pages: u32,
}

impl PageScope {
    pub fn all() -> Self {
        Self { pages: 0 }
    }

    pub fn first(pages: u32) -> Self {
        Self { pages }
    }

    pub fn is_open_ended(self) -> bool {
        self.pages == 0
    }

    pub fn label(self) -> String {
        if self.is_open_ended() {
            "all".to_string()
        } else {
            self.pages.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub found: u64,
    pub new: u64,
    pub updated: u64,
    pub removed: u64,
}

/// One synchronization pass. Created `running`, transitions once to a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub scope: PageScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub errors: Vec<String>,
    pub log: String,
    pub partial: bool,
}

impl RunRecord {
    pub fn start(run_id: Uuid, trigger: RunTrigger, scope: PageScope, at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            trigger,
            scope,
            started_at: at,
            finished_at: None,
            status: RunStatus::Running,
            counters: RunCounters::default(),
            errors: Vec::new(),
            log: format!("Sync starting (pages={}, trigger={}).", scope.label(), trigger.as_str()),
            partial: false,
        }
    }

    pub fn push_log(&mut self, line: impl AsRef<str>) {
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(line.as_ref());
    }
}

/// Singleton monitor settings plus the outcome of the most recent check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub pages: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_check_result: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            pages: 0,
            last_check_at: None,
            last_check_result: String::new(),
        }
    }
}

impl MonitorConfig {
    pub fn scope(&self) -> PageScope {
        PageScope::first(self.pages)
    }
}
