//! Purging of abandoned upload sessions

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::UploadConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::paths;
use crate::upload::{SessionRecord, UploadState};

/// Outcome of one sweep over the upload areas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Sessions removed.
    pub purged: Vec<Uuid>,
    /// Sessions that should have been removed but could not be.
    pub failed_to_purge: Vec<Uuid>,
}

impl BlobStore {
    /// Remove failed sessions, open sessions started before `cutoff`, and
    /// sessions whose record cannot be read.
    ///
    /// Sessions with a live handle in this process are left alone.
    #[tracing::instrument(skip(self))]
    pub async fn purge_uploads(&self, cutoff: DateTime<Utc>) -> RegistryResult<PurgeReport> {
        let objects = self.storage().list(Some(paths::repositories())).await?;
        let sessions: BTreeMap<Utf8PathBuf, Uuid> = objects
            .iter()
            .filter_map(|object| paths::parse_upload_path(object))
            .collect();

        let mut report = PurgeReport::default();
        for (dir, uuid) in sessions {
            match self.purge_session(&dir, uuid, cutoff).await {
                Ok(true) => report.purged.push(uuid),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(%uuid, "failed to purge upload: {err}");
                    report.failed_to_purge.push(uuid);
                }
            }
        }

        tracing::debug!(
            purged = report.purged.len(),
            failed = report.failed_to_purge.len(),
            "upload purge complete"
        );
        Ok(report)
    }

    async fn purge_session(
        &self,
        dir: &Utf8Path,
        uuid: Uuid,
        cutoff: DateTime<Utc>,
    ) -> RegistryResult<bool> {
        let Ok(_lease) = self.lease(uuid) else {
            tracing::trace!(%uuid, "upload in use, skipping");
            return Ok(false);
        };

        let expired = match SessionRecord::load(self, &paths::upload_record(dir)).await {
            Ok(Some(record)) => record.state == UploadState::Failed || record.started_at < cutoff,
            // Bytes without a record: a start that never completed.
            Ok(None) => match self.storage().metadata(&paths::upload_data(dir)).await {
                Ok(metadata) => metadata.created < cutoff,
                Err(err) if err.is_not_found() => true,
                Err(err) => return Err(err.into()),
            },
            Err(RegistryError::Corrupt { path, reason }) => {
                tracing::warn!(%uuid, %path, "unreadable upload record: {reason}");
                true
            }
            Err(err) => return Err(err),
        };

        if expired {
            self.storage().delete_prefix(dir).await?;
            tracing::debug!(%uuid, "upload purged");
        }
        Ok(expired)
    }
}

/// Sweep `blobs` every `purge-interval-secs` until the task is aborted.
pub(crate) fn spawn(blobs: BlobStore, config: UploadConfig) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            if !config.purge {
                tracing::debug!("upload purging disabled");
                return;
            }

            let max_age = TimeDelta::from_std(config.max_age()).unwrap_or(TimeDelta::MAX);
            let mut interval = tokio::time::interval(
                config
                    .purge_interval()
                    .max(std::time::Duration::from_secs(1)),
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let cutoff = Utc::now()
                    .checked_sub_signed(max_age)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                if let Err(err) = blobs.purge_uploads(cutoff).await {
                    tracing::warn!("upload purge failed: {err}");
                }
            }
        }
        .instrument(tracing::info_span!("upload-reaper")),
    )
}
