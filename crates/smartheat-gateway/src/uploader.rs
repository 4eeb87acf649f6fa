//! Draining the local queue toward the server.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use smartheat_store::Store;
use smartheat_types::{RecordKey, TelemetryKind};

use crate::server::{UploadError, Uploader};

/// Refused uploads after which a record is given up on.
pub const MAX_UPLOAD_ATTEMPTS: u32 = 5;

/// What one [`UploadSynchronizer::sync_pending`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Kind that was drained.
    pub kind: Option<TelemetryKind>,
    /// The connectivity probe failed, so nothing was attempted.
    pub offline: bool,
    /// Records accepted by the server.
    pub sent: usize,
    /// Records left pending for a later pass.
    pub retried: usize,
    /// Records marked as permanently failed.
    pub failed: usize,
    /// Records whose outcome could not be written to the store.
    pub store_errors: usize,
}

impl SyncReport {
    fn new(kind: TelemetryKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Number of records an upload was attempted for.
    pub fn attempted(&self) -> usize {
        self.sent + self.retried + self.failed + self.store_errors
    }
}

/// Uploads pending records and records each outcome in the store.
///
/// Connectivity failures leave a record pending forever; they count as an
/// attempt but never toward giving up. A record the server has refused
/// [`MAX_UPLOAD_ATTEMPTS`] times is marked as permanently failed.
pub struct UploadSynchronizer<U> {
    store: Arc<Mutex<Store>>,
    uploader: U,
}

impl<U: Uploader> UploadSynchronizer<U> {
    /// Create a synchronizer over a shared store.
    pub fn new(store: Arc<Mutex<Store>>, uploader: U) -> Self {
        Self { store, uploader }
    }

    /// The upload collaborator.
    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    /// Upload every pending record of `kind`, in insertion order.
    ///
    /// Never fails: every outcome is logged and reflected in the report.
    pub async fn sync_pending(&self, kind: TelemetryKind) -> SyncReport {
        let mut report = SyncReport::new(kind);

        if !self.uploader.is_connected().await {
            error!("Could not upload {} records. No connection to the server.", kind);
            report.offline = true;
            return report;
        }

        let pending = match self.store.lock().await.pending(kind) {
            Ok(pending) => pending,
            Err(e) => {
                error!("Could not read pending {} records: {}", kind, e);
                return report;
            }
        };

        if pending.is_empty() {
            debug!("No pending {} records", kind);
            return report;
        }

        info!("Uploading {} pending {} records", pending.len(), kind);

        for record in pending {
            let key = record.key();
            let outcome = self.uploader.upload(&record).await;

            match outcome {
                Ok(()) => match self.store.lock().await.mark_sent(&key) {
                    Ok(attempts) => {
                        info!("Upload successful: {}. Attempt #{}", record, attempts);
                        report.sent += 1;
                    }
                    Err(e) => self.store_failed(&mut report, &key, e),
                },
                Err(UploadError::Connectivity(cause)) => {
                    match self.store.lock().await.mark_retry(&key) {
                        Ok(attempts) => {
                            warn!(
                                "Could not upload: {}. Attempt #{}: {}",
                                record, attempts, cause
                            );
                            report.retried += 1;
                        }
                        Err(e) => self.store_failed(&mut report, &key, e),
                    }
                }
                Err(UploadError::Rejected(cause)) => {
                    let store = self.store.lock().await;
                    if record.rejections + 1 >= MAX_UPLOAD_ATTEMPTS {
                        match store.mark_permanent_error(&key) {
                            Ok(attempts) => {
                                error!(
                                    "Giving up on {} after {} attempts, {} refused: {}",
                                    record,
                                    attempts,
                                    record.rejections + 1,
                                    cause
                                );
                                report.failed += 1;
                            }
                            Err(e) => self.store_failed(&mut report, &key, e),
                        }
                    } else {
                        match store.mark_rejected(&key) {
                            Ok(rejections) => {
                                error!(
                                    "Upload refused: {}. Refusal #{}: {}",
                                    record, rejections, cause
                                );
                                report.retried += 1;
                            }
                            Err(e) => self.store_failed(&mut report, &key, e),
                        }
                    }
                }
            }
        }

        info!(
            "{} upload: {} sent, {} retried, {} failed",
            kind, report.sent, report.retried, report.failed
        );
        report
    }

    fn store_failed(&self, report: &mut SyncReport, key: &RecordKey, err: smartheat_store::Error) {
        error!("Could not record upload outcome for {}: {}", key, err);
        report.store_errors += 1;
    }
}
