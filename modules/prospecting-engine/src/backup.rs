//! Local-first JSON durability for prospects.
//!
//! Every prospect is written here before any database write. Files move
//! `pending → uploaded` on DB success or into `failed-uploads/` on DB
//! failure, and only the retention reaper ever deletes anything — and only
//! files that made it to `uploaded`.
//!
//! Atomicity: writes go to a temp file in the same directory, fsync, then
//! rename. Moves between the two subdirectories are plain renames on the
//! same filesystem, so a crash never observes a half-written record.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const PROSPECTS_SUBDIR: &str = "prospects";
const FAILED_SUBDIR: &str = "failed-uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
}

/// One backup file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub saved_at: DateTime<Utc>,
    pub id: Uuid,
    pub data: serde_json::Value,
    pub upload_status: UploadStatus,
    pub database_id: Option<Uuid>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub upload_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

pub struct BackupStore {
    prospects_dir: PathBuf,
    failed_dir: PathBuf,
}

impl BackupStore {
    /// Create the store under `<root>/prospecting-engine/`.
    pub fn new(root: &Path) -> Result<Self> {
        let base = root.join("prospecting-engine");
        let prospects_dir = base.join(PROSPECTS_SUBDIR);
        let failed_dir = base.join(FAILED_SUBDIR);
        std::fs::create_dir_all(&prospects_dir)
            .with_context(|| format!("Failed to create {}", prospects_dir.display()))?;
        std::fs::create_dir_all(&failed_dir)
            .with_context(|| format!("Failed to create {}", failed_dir.display()))?;
        Ok(Self {
            prospects_dir,
            failed_dir,
        })
    }

    /// Write a new `pending` record. The filename embeds a timestamp and a
    /// random suffix so concurrent writers never collide.
    pub fn save(&self, id: Uuid, data: serde_json::Value) -> Result<PathBuf> {
        let record = BackupRecord {
            saved_at: Utc::now(),
            id,
            data,
            upload_status: UploadStatus::Pending,
            database_id: None,
            uploaded_at: None,
            upload_error: None,
            failed_at: None,
        };

        let suffix: u32 = rand::rng().random();
        let filename = format!(
            "{}-{:08x}.json",
            record.saved_at.format("%Y%m%d%H%M%S%3f"),
            suffix
        );
        let path = self.prospects_dir.join(filename);
        write_atomic(&path, &record)?;
        Ok(path)
    }

    /// Transition a record to `uploaded`. Idempotent: a second call for a
    /// file that is already uploaded succeeds without change.
    pub fn mark_uploaded(&self, path: &Path, db_id: Uuid) -> Result<()> {
        let mut record = read_record(path)?;
        if record.upload_status == UploadStatus::Uploaded {
            return Ok(());
        }
        record.upload_status = UploadStatus::Uploaded;
        record.database_id = Some(db_id);
        record.uploaded_at = Some(Utc::now());
        record.upload_error = None;
        record.failed_at = None;
        write_atomic(path, &record)
    }

    /// Record the upload error and move the file into `failed-uploads/`.
    /// Returns the new path.
    pub fn mark_failed(&self, path: &Path, error: &str) -> Result<PathBuf> {
        let mut record = read_record(path)?;
        record.upload_status = UploadStatus::Failed;
        record.upload_error = Some(error.to_string());
        record.failed_at = Some(Utc::now());
        write_atomic(path, &record)?;

        let dest = self.failed_dir.join(file_name(path)?);
        std::fs::rename(path, &dest)
            .with_context(|| format!("Failed to move backup into {}", dest.display()))?;
        warn!(path = %dest.display(), error, "Backup marked failed");
        Ok(dest)
    }

    /// Lazily iterate `pending` records.
    pub fn list_pending(&self) -> Result<impl Iterator<Item = (PathBuf, BackupRecord)>> {
        Ok(scan_dir(&self.prospects_dir)?
            .filter(|(_, r)| r.upload_status == UploadStatus::Pending))
    }

    /// Lazily iterate records in `failed-uploads/`.
    pub fn list_failed(&self) -> Result<impl Iterator<Item = (PathBuf, BackupRecord)>> {
        scan_dir(&self.failed_dir)
    }

    /// Re-attempt a failed upload by handing the stored payload to
    /// `upload`. On success the record becomes `uploaded` and moves back to
    /// `prospects/`; on failure the file stays where it is.
    pub async fn retry_failed<F, Fut>(&self, path: &Path, upload: F) -> Result<PathBuf>
    where
        F: FnOnce(serde_json::Value) -> Fut,
        Fut: Future<Output = Result<Uuid>>,
    {
        let mut record = read_record(path)?;
        if record.upload_status != UploadStatus::Failed {
            bail!(
                "retry_failed called on a non-failed backup: {}",
                path.display()
            );
        }

        let db_id = upload(record.data.clone()).await?;

        record.upload_status = UploadStatus::Uploaded;
        record.database_id = Some(db_id);
        record.uploaded_at = Some(Utc::now());
        record.upload_error = None;
        record.failed_at = None;
        write_atomic(path, &record)?;

        let dest = self.prospects_dir.join(file_name(path)?);
        std::fs::rename(path, &dest)
            .with_context(|| format!("Failed to move backup back to {}", dest.display()))?;
        info!(path = %dest.display(), "Failed backup retried and uploaded");
        Ok(dest)
    }

    /// Delete `uploaded` files older than the cutoff. Pending and failed
    /// files are never touched.
    pub fn archive(&self, older_than_days: i64) -> Result<u32> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let mut deleted = 0u32;

        for (path, record) in scan_dir(&self.prospects_dir)? {
            if record.upload_status != UploadStatus::Uploaded {
                continue;
            }
            let Some(uploaded_at) = record.uploaded_at else {
                continue;
            };
            if uploaded_at < cutoff {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(deleted, older_than_days, "Archived uploaded backups");
        }
        Ok(deleted)
    }
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .with_context(|| format!("Backup path has no filename: {}", path.display()))
}

fn read_record(path: &Path) -> Result<BackupRecord> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read backup: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Corrupt backup record: {}", path.display()))
}

/// Write-temp-then-rename in the same directory, with fsync before rename.
fn write_atomic(path: &Path, record: &BackupRecord) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.sync_all()
            .with_context(|| format!("fsync failed for {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename into {}", path.display()))?;
    Ok(())
}

fn scan_dir(dir: &Path) -> Result<impl Iterator<Item = (PathBuf, BackupRecord)>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read backup dir: {}", dir.display()))?;
    Ok(entries.filter_map(|entry| {
        let path = entry.ok()?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return None;
        }
        match read_record(&path) {
            Ok(record) => Some((path, record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable backup file");
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BackupStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({"company_name": "Acme Plumbing"})
    }

    #[test]
    fn save_writes_pending_record() {
        let (_dir, store) = store();
        let path = store.save(Uuid::new_v4(), payload()).unwrap();
        assert!(path.exists());

        let record = read_record(&path).unwrap();
        assert_eq!(record.upload_status, UploadStatus::Pending);
        assert!(record.database_id.is_none());
        assert_eq!(store.list_pending().unwrap().count(), 1);
    }

    #[test]
    fn mark_uploaded_is_idempotent() {
        let (_dir, store) = store();
        let id = Uuid::new_v4();
        let path = store.save(id, payload()).unwrap();
        let db_id = Uuid::new_v4();

        store.mark_uploaded(&path, db_id).unwrap();
        let first = read_record(&path).unwrap();

        store.mark_uploaded(&path, Uuid::new_v4()).unwrap();
        let second = read_record(&path).unwrap();

        assert_eq!(second.upload_status, UploadStatus::Uploaded);
        assert_eq!(second.database_id, first.database_id, "second call is a no-op");
        assert_eq!(store.list_pending().unwrap().count(), 0);
    }

    #[test]
    fn mark_failed_moves_into_failed_dir() {
        let (_dir, store) = store();
        let path = store.save(Uuid::new_v4(), payload()).unwrap();

        let failed_path = store.mark_failed(&path, "db unavailable").unwrap();
        assert!(!path.exists());
        assert!(failed_path.exists());
        assert!(failed_path.parent().unwrap().ends_with(FAILED_SUBDIR));

        let record = read_record(&failed_path).unwrap();
        assert_eq!(record.upload_status, UploadStatus::Failed);
        assert_eq!(record.upload_error.as_deref(), Some("db unavailable"));
        assert_eq!(store.list_failed().unwrap().count(), 1);
    }

    #[tokio::test]
    async fn retry_failed_success_moves_back_and_uploads() {
        let (_dir, store) = store();
        let path = store.save(Uuid::new_v4(), payload()).unwrap();
        let failed_path = store.mark_failed(&path, "db down").unwrap();

        let db_id = Uuid::new_v4();
        let restored = store
            .retry_failed(&failed_path, |data| async move {
                assert_eq!(data["company_name"], "Acme Plumbing");
                Ok(db_id)
            })
            .await
            .unwrap();

        assert!(!failed_path.exists());
        let record = read_record(&restored).unwrap();
        assert_eq!(record.upload_status, UploadStatus::Uploaded);
        assert_eq!(record.database_id, Some(db_id));
        assert_eq!(store.list_failed().unwrap().count(), 0);
    }

    #[tokio::test]
    async fn retry_failed_failure_leaves_file_in_place() {
        let (_dir, store) = store();
        let path = store.save(Uuid::new_v4(), payload()).unwrap();
        let failed_path = store.mark_failed(&path, "db down").unwrap();

        let result = store
            .retry_failed(&failed_path, |_| async move {
                Err(anyhow::anyhow!("still down"))
            })
            .await;

        assert!(result.is_err());
        assert!(failed_path.exists());
        let record = read_record(&failed_path).unwrap();
        assert_eq!(record.upload_status, UploadStatus::Failed);
    }

    #[test]
    fn archive_deletes_only_old_uploaded_files() {
        let (_dir, store) = store();

        // Pending file — must survive
        let pending = store.save(Uuid::new_v4(), payload()).unwrap();
        // Failed file — must survive
        let failed = store.save(Uuid::new_v4(), payload()).unwrap();
        let failed = store.mark_failed(&failed, "nope").unwrap();
        // Uploaded long ago — must be reaped
        let old = store.save(Uuid::new_v4(), payload()).unwrap();
        let mut record = read_record(&old).unwrap();
        record.upload_status = UploadStatus::Uploaded;
        record.uploaded_at = Some(Utc::now() - Duration::days(60));
        write_atomic(&old, &record).unwrap();
        // Uploaded just now — must survive
        let fresh = store.save(Uuid::new_v4(), payload()).unwrap();
        store.mark_uploaded(&fresh, Uuid::new_v4()).unwrap();

        let deleted = store.archive(30).unwrap();
        assert_eq!(deleted, 1);
        assert!(pending.exists());
        assert!(failed.exists());
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}
