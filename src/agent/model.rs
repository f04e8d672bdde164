//! Domain values decoded from (or encoded for) the agent.

use super::error::DriverError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

fn millis_to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

/// Agent activity reported by the `status` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    Busy,
    Unconfigured,
}

impl AgentState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "IDLE" => Some(Self::Idle),
            "BUSY" => Some(Self::Busy),
            "UNCONFIGURED" => Some(Self::Unconfigured),
            _ => None,
        }
    }
}

/// Answer to the `control_accepted` poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
    Accepted,
    Wait,
    Refused,
}

impl AcceptDecision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "true" => Some(Self::Accepted),
            "wait" => Some(Self::Wait),
            "false" => Some(Self::Refused),
            _ => None,
        }
    }
}

/// Answer to the `key_persistence` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyGrant {
    Granted(String),
    Denied,
}

/// One version entry attached to an installed product.
///
/// Entries flagged `for_uninstall` are rollback targets, the others are
/// forward updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HybridInfo {
    pub version_name: String,
    pub for_uninstall: bool,
    /// Epoch milliseconds.
    pub install_date: Option<i64>,
    /// Epoch milliseconds.
    pub release_date: Option<i64>,
    pub description: Option<String>,
}

impl HybridInfo {
    pub fn installed_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.install_date)
    }

    pub fn released_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.release_date)
    }
}

/// An installed product found by a product search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub product_name: String,
    pub current_version: String,
    pub install_path: String,
    pub features: Vec<String>,
    pub hybrids: Vec<HybridInfo>,
}

impl SearchResult {
    /// Forward updates available for this product.
    pub fn updates(&self) -> impl Iterator<Item = &HybridInfo> {
        self.hybrids.iter().filter(|hybrid| !hybrid.for_uninstall)
    }

    /// Versions this product can be rolled back to.
    pub fn rollback_targets(&self) -> impl Iterator<Item = &HybridInfo> {
        self.hybrids.iter().filter(|hybrid| hybrid.for_uninstall)
    }

    pub fn has_updates(&self) -> bool {
        self.updates().next().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub product_name: String,
    pub version: String,
    pub description: String,
    pub download_file_name: String,
    /// Epoch milliseconds.
    pub release_date: Option<i64>,
}

impl CatalogEntry {
    pub fn released_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.release_date)
    }
}

/// One page of the agent catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogPage {
    pub page_count: Option<i64>,
    pub entries: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogSort {
    #[default]
    Name,
    Date,
    Version,
}

impl CatalogSort {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Date => "date",
            Self::Version => "version",
        }
    }
}

impl FromStr for CatalogSort {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "date" => Ok(Self::Date),
            "version" => Ok(Self::Version),
            other => Err(format!(
                "unsupported sort key '{other}', use 'name', 'date' or 'version'"
            )),
        }
    }
}

/// Parameters of a catalog page fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogQuery {
    pub page: u32,
    pub sort: CatalogSort,
    pub descending: bool,
    pub search: Option<String>,
}

/// Outcome code of an update or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Cancelled,
    Failed,
    Other(i32),
}

impl ActionOutcome {
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Cancelled,
            -1 => Self::Failed,
            other => Self::Other(other),
        }
    }

    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Cancelled => 1,
            Self::Failed => -1,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed => f.write_str("failed"),
            Self::Other(code) => write!(f, "status {code}"),
        }
    }
}

/// A past update or rollback, as recorded by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionHistoryRecord {
    pub product_name: String,
    /// Epoch milliseconds.
    pub action_date: Option<i64>,
    pub previous_version: String,
    pub target_version: String,
    pub features: Vec<String>,
    pub downgrade: bool,
    pub status: Option<ActionOutcome>,
}

impl ActionHistoryRecord {
    pub fn performed_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.action_date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Update,
    Rollback,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Rollback => "rollback",
        }
    }
}

impl FromStr for ActionKind {
    type Err = DriverError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "update" => Ok(Self::Update),
            "rollback" => Ok(Self::Rollback),
            _ => Err(DriverError::InvalidActionType),
        }
    }
}

/// A rollback selection: a product of the cached search plus the version to return to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackTarget {
    pub index: usize,
    pub version: HybridInfo,
}

/// Work handed to the agent by `perform_actions`.
///
/// Indices refer to positions in the driver's cached product list and are only
/// meaningful until the next product search replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    Update(Vec<usize>),
    Rollback(Vec<RollbackTarget>),
}

impl ActionRequest {
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::Update(_) => ActionKind::Update,
            Self::Rollback(_) => ActionKind::Rollback,
        }
    }
}

/// Result of one performed action, matched back to its product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub product: SearchResult,
    pub outcome: ActionOutcome,
}
