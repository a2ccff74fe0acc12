//! JSON persistence for the risk controller

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::position::Position;
use crate::common::errors::{EngineError, Result};

/// On-disk snapshot of the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub open_positions: Vec<Position>,
    #[serde(default)]
    pub closed_positions: Vec<Position>,
    #[serde(default)]
    pub daily_trades_count: u32,
    #[serde(default)]
    pub daily_pnl: Decimal,
    #[serde(default)]
    pub last_reset_date: Option<NaiveDate>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// File-backed store. Writes go to a sibling temp file which is then renamed
/// over the target, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot; `None` if the file doesn't exist yet
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Persistence(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            open = state.open_positions.len(),
            closed = state.closed_positions.len(),
            "Saved positions"
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "positions.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
