//! In-memory server collaborators for testing.
//!
//! [`MockUploader`] stands in for the upload server, with per-thermostat
//! failure injection; [`MockDirectory`] serves a fixed thermostat list and
//! heating tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use smartheat_types::{HeatingTableEntry, TelemetryRecord};

use crate::server::{Directory, LinkedThermostat, ServerError, UploadError, Uploader};

/// Failure returned by [`MockUploader`] for a thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockUploadFailure {
    /// The server could not be reached.
    Connectivity,
    /// The server refused the record.
    Rejected,
}

/// Upload server double.
pub struct MockUploader {
    connected: AtomicBool,
    failures: RwLock<HashMap<String, MockUploadFailure>>,
    accepted: RwLock<Vec<TelemetryRecord>>,
    upload_count: AtomicU32,
    probe_count: AtomicU32,
}

impl Default for MockUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUploader {
    /// A connected server that accepts everything.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            failures: RwLock::new(HashMap::new()),
            accepted: RwLock::new(Vec::new()),
            upload_count: AtomicU32::new(0),
            probe_count: AtomicU32::new(0),
        }
    }

    /// Set what the connectivity probe reports.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every upload for `mac` fail.
    pub async fn fail_mac(&self, mac: &str, failure: MockUploadFailure) {
        self.failures.write().await.insert(mac.to_string(), failure);
    }

    /// Accept uploads for every thermostat again.
    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    /// Records accepted so far, in upload order.
    pub async fn accepted(&self) -> Vec<TelemetryRecord> {
        self.accepted.read().await.clone()
    }

    /// Number of upload attempts, successful or not.
    pub fn upload_count(&self) -> u32 {
        self.upload_count.load(Ordering::SeqCst)
    }

    /// Number of connectivity probes.
    pub fn probe_count(&self) -> u32 {
        self.probe_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn is_connected(&self) -> bool {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        self.connected.load(Ordering::SeqCst)
    }

    async fn upload(&self, record: &TelemetryRecord) -> Result<(), UploadError> {
        self.upload_count.fetch_add(1, Ordering::SeqCst);

        if !self.connected.load(Ordering::SeqCst) {
            return Err(UploadError::Connectivity("server offline".to_string()));
        }

        match self.failures.read().await.get(&record.mac) {
            Some(MockUploadFailure::Connectivity) => Err(UploadError::Connectivity(format!(
                "connection reset uploading {}",
                record.mac
            ))),
            Some(MockUploadFailure::Rejected) => Err(UploadError::Rejected(format!(
                "Unknown device {}",
                record.mac
            ))),
            None => {
                self.accepted.write().await.push(record.clone());
                Ok(())
            }
        }
    }
}

/// Directory server double.
#[derive(Default)]
pub struct MockDirectory {
    gateways: RwLock<HashMap<String, Vec<LinkedThermostat>>>,
    tables: RwLock<HashMap<String, Vec<HeatingTableEntry>>>,
}

impl MockDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway and the thermostats linked to it.
    pub async fn add_gateway(&self, mac: &str, thermostats: Vec<LinkedThermostat>) {
        self.gateways
            .write()
            .await
            .insert(mac.to_string(), thermostats);
    }

    /// Publish a heating table at `url`.
    pub async fn publish_table(&self, url: &str, entries: Vec<HeatingTableEntry>) {
        self.tables.write().await.insert(url.to_string(), entries);
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn linked_thermostats(
        &self,
        gateway_mac: &str,
    ) -> Result<Vec<LinkedThermostat>, ServerError> {
        self.gateways
            .read()
            .await
            .get(gateway_mac)
            .cloned()
            .ok_or_else(|| ServerError::UnknownDevice(gateway_mac.to_string()))
    }

    async fn heating_table(&self, url: &str) -> Result<Vec<HeatingTableEntry>, ServerError> {
        self.tables
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| ServerError::Api {
                url: url.to_string(),
                status: 404,
                message: "Not found".to_string(),
            })
    }
}
