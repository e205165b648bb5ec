use crate::submission::SubmissionRecord;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_RECENT_SUBMISSIONS: usize = 250;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to prepare submission directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to append submission: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode submission: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An accepted opinion as it sits in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "web", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StoredSubmission {
    pub id: String,
    /// Seconds since the Unix epoch.
    pub received_at: u64,
    #[serde(flatten)]
    pub record: SubmissionRecord,
    pub location: String,
    /// File name inside the image archive, if one was rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Append-only submission log.
///
/// Persistent logs write one JSON object per line; both kinds keep a bounded
/// window of recent submissions in memory.
#[derive(Clone)]
pub struct SubmissionLog {
    shared: Arc<LogShared>,
}

struct LogShared {
    path: Option<PathBuf>,
    recent: RwLock<VecDeque<StoredSubmission>>,
    // serializes file appends so concurrent lines never interleave
    write_lock: Mutex<()>,
    total: AtomicU64,
}

impl SubmissionLog {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self::with_path(Some(path.into()))
    }

    pub fn ephemeral() -> Self {
        Self::with_path(None)
    }

    fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(LogShared {
                path,
                recent: RwLock::new(VecDeque::new()),
                write_lock: Mutex::new(()),
                total: AtomicU64::new(0),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    pub fn append(
        &self,
        record: SubmissionRecord,
        location: String,
        image: Option<String>,
    ) -> Result<StoredSubmission, StoreError> {
        let stored = StoredSubmission {
            id: generate_submission_id(),
            received_at: now_ts(),
            record,
            location,
            image,
        };
        if let Some(path) = &self.shared.path {
            let mut line = serde_json::to_vec(&stored)?;
            line.push(b'\n');
            let _guard = self.shared.write_lock.lock();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(&line)?;
        }

        let mut recent = self.shared.recent.write();
        recent.push_back(stored.clone());
        while recent.len() > MAX_RECENT_SUBMISSIONS {
            recent.pop_front();
        }
        drop(recent);
        self.shared.total.fetch_add(1, Ordering::Relaxed);
        Ok(stored)
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<StoredSubmission> {
        let guard = self.shared.recent.read();
        guard.iter().rev().take(limit).cloned().collect()
    }

    /// Submissions accepted since this log was opened.
    pub fn total(&self) -> u64 {
        self.shared.total.load(Ordering::Relaxed)
    }
}

pub fn generate_submission_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
