//! One synchronization cycle.
//!
//! A cycle runs strictly ordered phases: poll telemetry, store it, resolve
//! schedules, enforce the operating mode, set targets, then drain the upload
//! queue. Within a phase every thermostat is handled concurrently and each
//! one's result lands in its own slot of the joined output, so a slow or
//! failing thermostat only costs its own step.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, error, info, warn};

use smartheat_core::{DeviceClient, Transport, format_temperature, same_setpoint};
use smartheat_store::Store;
use smartheat_types::{
    AddressError, DeviceAddress, LinkPrefix, ScheduleError, TelemetryKind, TelemetryRecord,
    ThermostatRef,
};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::config::{CycleConfig, DevicesConfig};
use crate::server::Uploader;
use crate::thermostats::ThermostatConfig;
use crate::uploader::{SyncReport, UploadSynchronizer};

/// Knobs for a cycle, taken from the `[devices]` and `[cycle]` sections.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSettings {
    /// Prefix used to derive thermostat addresses.
    pub prefix: LinkPrefix,
    /// Wait between dependent requests to the same thermostat.
    pub pacing: Duration,
    /// Operating mode every thermostat is switched to.
    pub target_mode: String,
    /// Reads of the current target before giving up on it.
    pub target_reads: u32,
    /// Upper bound on the device phases of one cycle.
    pub deadline: Duration,
    /// Offset used for schedules when the local offset cannot be determined.
    pub utc_offset: UtcOffset,
}

impl CycleSettings {
    /// Settings from the gateway configuration.
    pub fn new(devices: &DevicesConfig, cycle: &CycleConfig) -> Self {
        Self {
            prefix: devices.prefix.clone(),
            pacing: devices.pacing(),
            target_mode: devices.target_mode.clone(),
            target_reads: devices.target_retries,
            deadline: cycle.deadline(),
            utc_offset: UtcOffset::UTC,
        }
    }

    /// Use `offset` when the local offset is unavailable.
    #[must_use]
    pub fn with_utc_offset(mut self, offset: UtcOffset) -> Self {
        self.utc_offset = offset;
        self
    }
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self::new(&DevicesConfig::default(), &CycleConfig::default())
    }
}

/// A single reading and when it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub captured_at: OffsetDateTime,
    pub value: f32,
}

/// Telemetry gathered from one thermostat. `None` means that read failed.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub mac: String,
    pub address: DeviceAddress,
    pub temperature: Option<Sample>,
    pub rssi: Option<Sample>,
}

impl PollResult {
    /// The record for `kind`, if that reading succeeded.
    pub fn record(&self, kind: TelemetryKind) -> Option<TelemetryRecord> {
        let sample = match kind {
            TelemetryKind::Temperature => self.temperature,
            TelemetryKind::Rssi => self.rssi,
        }?;
        Some(TelemetryRecord::new(
            self.mac.clone(),
            sample.captured_at,
            kind,
            sample.value,
        ))
    }
}

/// Outcome of the mode or target step for one thermostat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The thermostat already had the wanted value.
    Unchanged,
    /// A write was issued and acknowledged.
    Updated,
    /// The write failed.
    Failed(String),
    /// The step was not attempted.
    Skipped(String),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

/// Everything a cycle did to one thermostat.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub mac: String,
    pub address: Option<DeviceAddress>,
    pub temperature: Option<f32>,
    pub rssi: Option<f32>,
    /// Target resolved from the heating table.
    pub scheduled: Option<f32>,
    pub mode: StepOutcome,
    pub target: StepOutcome,
}

impl DeviceReport {
    fn invalid(mac: String, err: &AddressError) -> Self {
        let reason = err.to_string();
        Self {
            mac,
            address: None,
            temperature: None,
            rssi: None,
            scheduled: None,
            mode: StepOutcome::Skipped(reason.clone()),
            target: StepOutcome::Skipped(reason),
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub started_at: OffsetDateTime,
    /// One entry per configured thermostat.
    pub devices: Vec<DeviceReport>,
    /// Records appended to the store.
    pub stored: usize,
    /// One report per telemetry kind.
    pub uploads: Vec<SyncReport>,
}

impl CycleReport {
    /// Thermostats that answered at least one telemetry read.
    pub fn polled(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.temperature.is_some() || d.rssi.is_some())
            .count()
    }

    /// Mode and target writes that failed.
    pub fn failed_steps(&self) -> usize {
        self.devices
            .iter()
            .map(|d| usize::from(d.mode.is_failure()) + usize::from(d.target.is_failure()))
            .sum()
    }
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Device(#[from] smartheat_core::Error),
    #[error("cycle deadline reached")]
    Deadline,
}

/// Run `request` unless the cycle deadline passes first. Once the deadline
/// has passed the request is dropped unpolled, so nothing is sent.
async fn before<T>(
    deadline: Instant,
    request: impl Future<Output = smartheat_core::Result<T>>,
) -> Result<T, StepError> {
    if Instant::now() >= deadline {
        return Err(StepError::Deadline);
    }
    match timeout_at(deadline, request).await {
        Ok(result) => result.map_err(StepError::from),
        Err(_) => Err(StepError::Deadline),
    }
}

struct Device {
    thermostat: ThermostatRef,
    address: DeviceAddress,
}

/// Drives cycles over injected collaborators.
pub struct SyncOrchestrator<T, U, C> {
    client: DeviceClient<T>,
    store: Arc<Mutex<Store>>,
    synchronizer: UploadSynchronizer<U>,
    thermostats: C,
    settings: CycleSettings,
}

impl<T, U, C> SyncOrchestrator<T, U, C>
where
    T: Transport,
    U: Uploader,
    C: ThermostatConfig,
{
    pub fn new(
        transport: T,
        store: Arc<Mutex<Store>>,
        uploader: U,
        thermostats: C,
        settings: CycleSettings,
    ) -> Self {
        let synchronizer = UploadSynchronizer::new(Arc::clone(&store), uploader);
        Self {
            client: DeviceClient::new(transport),
            store,
            synchronizer,
            thermostats,
            settings,
        }
    }

    pub fn client(&self) -> &DeviceClient<T> {
        &self.client
    }

    pub fn store(&self) -> &Arc<Mutex<Store>> {
        &self.store
    }

    pub fn synchronizer(&self) -> &UploadSynchronizer<U> {
        &self.synchronizer
    }

    pub fn thermostats(&self) -> &C {
        &self.thermostats
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Run a cycle at the current local time.
    pub async fn run_cycle(&self) -> CycleReport {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| {
            debug!("Local offset unavailable, using {}", self.settings.utc_offset);
            OffsetDateTime::now_utc().to_offset(self.settings.utc_offset)
        });
        self.run_cycle_at(now).await
    }

    /// Run a cycle, resolving schedules against `now`.
    ///
    /// Telemetry timestamps always come from the system clock; `now` only
    /// picks the heating table entry. Never fails: every per-thermostat
    /// failure is logged and reported.
    pub async fn run_cycle_at(&self, now: OffsetDateTime) -> CycleReport {
        let deadline = Instant::now() + self.settings.deadline;
        info!("Starting cycle at {}", now);

        let (devices, mut reports) = self.devices();

        let polls = join_all(devices.iter().map(|device| self.poll(device, deadline))).await;
        let stored = self.store_polls(&polls).await;

        let local = PrimitiveDateTime::new(now.date(), now.time());
        let scheduled: Vec<Result<f32, String>> = devices
            .iter()
            .map(|device| self.scheduled_target(device, local))
            .collect();

        let modes =
            join_all(devices.iter().map(|device| self.enforce_mode(device, deadline))).await;
        let targets = join_all(
            devices
                .iter()
                .zip(&scheduled)
                .map(|(device, target)| self.set_target(device, target, deadline)),
        )
        .await;

        let mut uploads = Vec::with_capacity(TelemetryKind::ALL.len());
        for kind in TelemetryKind::ALL {
            uploads.push(self.synchronizer.sync_pending(kind).await);
        }

        for ((((device, poll), target), mode), outcome) in devices
            .into_iter()
            .zip(polls)
            .zip(scheduled)
            .zip(modes)
            .zip(targets)
        {
            reports.push(DeviceReport {
                mac: device.thermostat.mac,
                address: Some(device.address),
                temperature: poll.temperature.map(|s| s.value),
                rssi: poll.rssi.map(|s| s.value),
                scheduled: target.ok(),
                mode,
                target: outcome,
            });
        }

        let report = CycleReport {
            started_at: now,
            devices: reports,
            stored,
            uploads,
        };
        info!(
            "Cycle finished: {} of {} thermostats polled, {} records stored, {} failed writes",
            report.polled(),
            report.devices.len(),
            report.stored,
            report.failed_steps()
        );
        report
    }

    /// Drain both telemetry kinds without touching any thermostat.
    pub async fn upload_pending(&self) -> Vec<SyncReport> {
        let mut reports = Vec::with_capacity(TelemetryKind::ALL.len());
        for kind in TelemetryKind::ALL {
            reports.push(self.synchronizer.sync_pending(kind).await);
        }
        reports
    }

    /// Addressable thermostats, plus reports for the ones that are not.
    fn devices(&self) -> (Vec<Device>, Vec<DeviceReport>) {
        let macs = match self.thermostats.thermostat_macs() {
            Ok(Some(macs)) => macs,
            Ok(None) => {
                error!("No thermostats defined in local config");
                Vec::new()
            }
            Err(e) => {
                error!("Could not read thermostat list: {}", e);
                Vec::new()
            }
        };

        let mut devices = Vec::with_capacity(macs.len());
        let mut invalid = Vec::new();
        for mac in macs {
            match DeviceAddress::from_mac_with_prefix(&mac, &self.settings.prefix) {
                Ok(address) => devices.push(Device {
                    thermostat: ThermostatRef::new(mac),
                    address,
                }),
                Err(e) => {
                    error!("Skipping thermostat {}: {}", mac, e);
                    invalid.push(DeviceReport::invalid(mac, &e));
                }
            }
        }
        (devices, invalid)
    }

    /// Wait the full pacing delay. When that would overrun the deadline,
    /// wait for the deadline instead and fail, so no request follows a
    /// shortened pause.
    async fn pace(&self, deadline: Instant) -> Result<(), StepError> {
        let resume = Instant::now() + self.settings.pacing;
        if resume > deadline {
            sleep_until(deadline).await;
            return Err(StepError::Deadline);
        }
        sleep_until(resume).await;
        Ok(())
    }

    async fn poll(&self, device: &Device, deadline: Instant) -> PollResult {
        let captured_at = OffsetDateTime::now_utc();
        let temperature = match before(deadline, self.client.read_temperature(&device.address)).await
        {
            Ok(value) => Some(Sample { captured_at, value }),
            Err(e) => {
                error!("Could not read temperature of {}: {}", device.thermostat, e);
                None
            }
        };

        let heartbeat = async {
            self.pace(deadline).await?;
            before(deadline, self.client.read_heartbeat(&device.address))
                .await
                .map(|heartbeat| (OffsetDateTime::now_utc(), heartbeat))
        };
        let rssi = match heartbeat.await {
            Ok((captured_at, heartbeat)) => {
                debug!(
                    "{} runs {:?} with uptime {:?}",
                    device.thermostat, heartbeat.version, heartbeat.uptime
                );
                Some(Sample {
                    captured_at,
                    value: heartbeat.rssi,
                })
            }
            Err(e) => {
                error!("Could not read heartbeat of {}: {}", device.thermostat, e);
                None
            }
        };

        PollResult {
            mac: device.thermostat.mac.clone(),
            address: device.address,
            temperature,
            rssi,
        }
    }

    /// Append one batch per kind. A failed batch is retried record by
    /// record so one duplicate does not drop its neighbours.
    async fn store_polls(&self, polls: &[PollResult]) -> usize {
        let store = self.store.lock().await;
        let mut stored = 0;

        for kind in TelemetryKind::ALL {
            let records: Vec<TelemetryRecord> =
                polls.iter().filter_map(|poll| poll.record(kind)).collect();
            if records.is_empty() {
                continue;
            }

            match store.append_batch(&records) {
                Ok(count) => {
                    info!("Stored {} {} records", count, kind);
                    stored += count;
                }
                Err(e) => {
                    warn!("Could not store {} batch: {}; storing one by one", kind, e);
                    for record in &records {
                        match store.append(record) {
                            Ok(()) => stored += 1,
                            Err(e) => error!("Could not store {}: {}", record, e),
                        }
                    }
                }
            }
        }
        stored
    }

    fn scheduled_target(&self, device: &Device, now: PrimitiveDateTime) -> Result<f32, String> {
        let table = self.thermostats.heating_table(&device.thermostat.mac).map_err(|e| {
            error!("Could not load heating table of {}: {}", device.thermostat, e);
            e.to_string()
        })?;

        match table.resolve(now) {
            Ok(target) => {
                info!("Scheduled target for {}: {}", device.thermostat, target);
                Ok(target)
            }
            Err(ScheduleError::Empty) => {
                warn!("No heating table for {}, not setting a target", device.thermostat);
                Err(ScheduleError::Empty.to_string())
            }
            Err(e) => {
                error!("Invalid heating table for {}: {}", device.thermostat, e);
                Err(e.to_string())
            }
        }
    }

    async fn enforce_mode(&self, device: &Device, deadline: Instant) -> StepOutcome {
        let wanted = self.settings.target_mode.as_str();

        // The heartbeat read of the poll phase was the last request.
        if let Err(e) = self.pace(deadline).await {
            return StepOutcome::Failed(e.to_string());
        }

        match before(deadline, self.client.read_mode(&device.address)).await {
            Ok(mode) if mode == wanted => {
                info!("{} is already in mode '{}'", device.thermostat, wanted);
                return StepOutcome::Unchanged;
            }
            Ok(mode) => info!(
                "{} is in mode '{}', switching to '{}'",
                device.thermostat, mode, wanted
            ),
            Err(StepError::Deadline) => {
                return StepOutcome::Failed(StepError::Deadline.to_string());
            }
            Err(e) => warn!("Could not read mode of {}: {}", device.thermostat, e),
        }

        let write = async {
            self.pace(deadline).await?;
            before(deadline, self.client.write_mode(&device.address, wanted)).await
        };
        match write.await {
            Ok(()) => {
                info!("Set mode of {} to '{}'", device.thermostat, wanted);
                StepOutcome::Updated
            }
            Err(e) => {
                error!("Could not set mode of {}: {}", device.thermostat, e);
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    async fn set_target(
        &self,
        device: &Device,
        scheduled: &Result<f32, String>,
        deadline: Instant,
    ) -> StepOutcome {
        let target = match scheduled {
            Ok(target) => *target,
            Err(reason) => return StepOutcome::Skipped(reason.clone()),
        };
        if let Err(e) = self.pace(deadline).await {
            return StepOutcome::Failed(e.to_string());
        }

        let current = self.client.read_target_paced(
            &device.address,
            self.settings.target_reads,
            self.settings.pacing,
        );
        match before(deadline, current).await {
            Ok(current) if same_setpoint(current, target) => {
                info!("{} already targets {}", device.thermostat, format_temperature(target));
                return StepOutcome::Unchanged;
            }
            Ok(current) => info!(
                "{} targets {}, scheduled {}",
                device.thermostat,
                format_temperature(current),
                format_temperature(target)
            ),
            Err(StepError::Deadline) => {
                return StepOutcome::Failed(StepError::Deadline.to_string());
            }
            Err(e) => warn!("Could not read target of {}: {}", device.thermostat, e),
        }

        let write = async {
            self.pace(deadline).await?;
            before(deadline, self.client.write_target(&device.address, target)).await
        };
        match write.await {
            Ok(()) => {
                info!("Set target of {} to {}", device.thermostat, format_temperature(target));
                StepOutcome::Updated
            }
            Err(e) => {
                error!("Could not set target of {}: {}", device.thermostat, e);
                StepOutcome::Failed(e.to_string())
            }
        }
    }
}
