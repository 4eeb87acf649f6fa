//! End-to-end cycles against the mock transport, an in-memory store and
//! scripted server collaborators.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::{datetime, time};
use tokio::sync::Mutex;

use smartheat_core::{MockFailure, MockThermostat, MockTransport, TARGET_MODE};
use smartheat_gateway::mock::{MockDirectory, MockUploader};
use smartheat_gateway::{
    CycleSettings, FileThermostatConfig, LinkedThermostat, StepOutcome, SyncOrchestrator,
    ThermostatConfig, refresh,
};
use smartheat_store::Store;
use smartheat_types::{DeviceAddress, HeatingTableEntry, RecordStatus, TelemetryKind};

const GATEWAY: &str = "b8:27:eb:12:34:56";
const MACS: [&str; 4] = [
    "2e:ff:ff:00:22:8b",
    "2e:ff:ff:00:22:8c",
    "2e:ff:ff:00:22:8d",
    "2e:ff:ff:00:22:8e",
];

// Sunday 23:30 and the following Monday 07:00.
const SUNDAY_NIGHT: OffsetDateTime = datetime!(2024-03-10 23:30 UTC);
const MONDAY_MORNING: OffsetDateTime = datetime!(2024-03-11 07:00 UTC);

fn address(mac: &str) -> DeviceAddress {
    DeviceAddress::from_mac(mac).unwrap()
}

fn table_url(mac: &str) -> String {
    format!("http://server/thermostat/{}/heating_table/", mac)
}

async fn directory() -> MockDirectory {
    let directory = MockDirectory::new();
    directory
        .add_gateway(
            GATEWAY,
            MACS.iter()
                .map(|mac| LinkedThermostat {
                    mac: mac.to_string(),
                    heating_table_url: Some(table_url(mac)),
                })
                .collect(),
        )
        .await;
    for mac in MACS {
        directory
            .publish_table(
                &table_url(mac),
                vec![
                    HeatingTableEntry::new(0, time!(06:30), 21.0),
                    HeatingTableEntry::new(6, time!(22:00), 16.0),
                ],
            )
            .await;
    }
    directory
}

async fn transport() -> MockTransport {
    let transport = MockTransport::new();
    let latencies = [700, 20, 350, 0];
    for (mac, latency) in MACS.iter().zip(latencies) {
        transport
            .add_device(
                address(mac),
                MockThermostat::new(19.5)
                    .with_rssi(-60 - latency as i32 / 10)
                    .with_latency(Duration::from_millis(latency)),
            )
            .await;
    }
    transport
}

#[tokio::test(start_paused = true)]
async fn test_refresh_then_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let thermostats = FileThermostatConfig::new(dir.path().join("thermostats.json"));
    let report = refresh(&directory().await, &thermostats, GATEWAY)
        .await
        .unwrap();
    assert_eq!(report.tables_updated, MACS.len());

    let uploader = MockUploader::new();
    uploader.set_connected(false);
    let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
    let gateway = SyncOrchestrator::new(
        transport().await,
        Arc::clone(&store),
        uploader,
        thermostats,
        CycleSettings::default(),
    );

    // Offline: every reading stays queued.
    let first = gateway.run_cycle_at(SUNDAY_NIGHT).await;
    assert_eq!(first.devices.len(), MACS.len());
    assert_eq!(first.stored, MACS.len() * 2);
    assert!(first.uploads.iter().all(|u| u.offline));
    for device in &first.devices {
        assert_eq!(device.scheduled, Some(16.0));
        assert_eq!(device.mode, StepOutcome::Updated);
        assert_eq!(device.target, StepOutcome::Updated);
    }

    // Back online: the backlog and the new readings go out together.
    gateway.synchronizer().uploader().set_connected(true);
    let second = gateway.run_cycle_at(MONDAY_MORNING).await;
    assert_eq!(second.uploads[0].sent, MACS.len() * 2);
    assert_eq!(second.uploads[1].sent, MACS.len() * 2);
    for device in &second.devices {
        assert_eq!(device.scheduled, Some(21.0));
        assert_eq!(device.mode, StepOutcome::Unchanged);
        assert_eq!(device.target, StepOutcome::Updated);
    }

    let transport = gateway.client().transport();
    for mac in MACS {
        let device = transport.device(&address(mac)).await.unwrap();
        assert_eq!(device.mode, TARGET_MODE);
        assert_eq!(device.target, 21.0);
    }

    let store = store.lock().await;
    for kind in TelemetryKind::ALL {
        let stats = store.stats(kind).unwrap();
        assert_eq!(stats.sent, (MACS.len() * 2) as u64);
        assert_eq!(stats.new, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_thermostat_does_not_hold_back_others() {
    let transport = transport().await;
    transport
        .update_device(&address(MACS[2]), |t| t.failure = Some(MockFailure::Timeout))
        .await;
    let thermostats = smartheat_gateway::MemoryThermostatConfig::with_thermostats(MACS);
    for mac in MACS {
        thermostats
            .save_heating_table(
                mac,
                &smartheat_types::HeatingTable::new(vec![HeatingTableEntry::new(
                    0,
                    time!(00:00),
                    20.0,
                )])
                .unwrap(),
            )
            .unwrap();
    }
    let gateway = SyncOrchestrator::new(
        transport,
        Arc::new(Mutex::new(Store::open_in_memory().unwrap())),
        MockUploader::new(),
        thermostats,
        CycleSettings::default(),
    );

    let cycle = gateway.run_cycle_at(MONDAY_MORNING).await;
    assert_eq!(cycle.devices.len(), MACS.len());
    assert_eq!(cycle.polled(), MACS.len() - 1);
    for device in &cycle.devices {
        if device.mac == MACS[2] {
            assert_eq!(device.temperature, None);
            assert!(device.target.is_failure());
        } else {
            assert_eq!(device.temperature, Some(19.5));
            assert_eq!(device.target, StepOutcome::Updated);
        }
    }

    let store = gateway.store().lock().await;
    let stored = store
        .query(&smartheat_store::RecordQuery::new(TelemetryKind::Temperature))
        .unwrap();
    assert_eq!(stored.len(), MACS.len() - 1);
    assert!(stored.iter().all(|r| r.status == RecordStatus::Sent));
}
