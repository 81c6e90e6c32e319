use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vudash_core::history::ChartHistory;
use vudash_core::report::VuReport;

use crate::error::Result;

/// The persisted cross-reload state: latest data, full chart history and
/// stop times for every dashboard known so far. camelCase keys keep the file
/// compatible with what the browser-side code wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub dashboard_data: BTreeMap<String, Vec<VuReport>>,
    pub chart_histories: BTreeMap<String, ChartHistory>,
    pub dashboard_stop_times: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.dashboard_data.is_empty()
            && self.chart_histories.is_empty()
            && self.dashboard_stop_times.is_empty()
    }
}

/// Whole-file blob store for [`Snapshot`]s: full-overwrite reads and writes,
/// last writer wins. Intentionally durable only within one process lifetime
/// when opened in ephemeral mode.
pub struct SnapshotStore {
    path: PathBuf,
    ephemeral: bool,
}

impl SnapshotStore {
    pub fn open(path: impl Into<PathBuf>, ephemeral: bool) -> Self {
        Self {
            path: path.into(),
            ephemeral,
        }
    }

    /// The last snapshot, or the empty-shaped snapshot when the file is
    /// absent or corrupt. Never an error: a broken snapshot just means a
    /// cold start.
    pub fn read(&self) -> Snapshot {
        let bytes = match fs::read(&self.path) {
            Ok(v) => v,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to read snapshot");
                }
                return Snapshot::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "corrupt snapshot, starting empty");
                Snapshot::default()
            }
        }
    }

    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// In ephemeral mode, resets the file to the empty-shaped snapshot.
    /// Called once from the process shutdown hook.
    pub fn close(&self) -> Result<()> {
        if self.ephemeral {
            tracing::info!(path = %self.path.display(), "resetting snapshot on shutdown");
            return self.write(&Snapshot::default());
        }
        Ok(())
    }
}
