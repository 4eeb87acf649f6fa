//! Refreshing the local thermostat configuration from the directory.

use serde::Serialize;
use tracing::{error, info, warn};

use smartheat_types::HeatingTable;

use crate::server::{Directory, ServerError};
use crate::thermostats::{ThermostatConfig, ThermostatsError};

/// Errors that abort a refresh.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Failed to fetch linked thermostats: {0}")]
    Server(#[from] ServerError),
    #[error("Failed to save thermostat config: {0}")]
    Config(#[from] ThermostatsError),
}

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Thermostats linked to this gateway.
    pub thermostats: usize,
    /// Heating tables that differed and were saved.
    pub tables_updated: usize,
    /// Heating tables that were already current.
    pub tables_unchanged: usize,
    /// Heating tables that could not be fetched, validated or saved.
    pub tables_failed: usize,
}

/// Replace the thermostat list with the directory's and download every
/// linked thermostat's heating table, saving only the ones that changed.
///
/// Failing to list the thermostats aborts the refresh before anything is
/// written. A heating table that fails is logged and skipped.
pub async fn refresh<D, C>(
    directory: &D,
    config: &C,
    gateway_mac: &str,
) -> Result<RefreshReport, RefreshError>
where
    D: Directory + ?Sized,
    C: ThermostatConfig + ?Sized,
{
    info!("Fetching thermostats linked to {}", gateway_mac);
    let linked = directory.linked_thermostats(gateway_mac).await?;

    let macs: Vec<String> = linked.iter().map(|t| t.mac.clone()).collect();
    config.save_thermostat_macs(&macs)?;
    info!("Saved {} linked thermostat(s)", macs.len());

    let mut report = RefreshReport {
        thermostats: linked.len(),
        ..Default::default()
    };

    for thermostat in &linked {
        let Some(url) = &thermostat.heating_table_url else {
            warn!("Thermostat {} has no heating table", thermostat.mac);
            continue;
        };

        let table = match directory.heating_table(url).await {
            Ok(entries) => match HeatingTable::new(entries) {
                Ok(table) => table,
                Err(e) => {
                    error!("Invalid heating table for {}: {}", thermostat.mac, e);
                    report.tables_failed += 1;
                    continue;
                }
            },
            Err(e) => {
                error!("Could not download heating table for {}: {}", thermostat.mac, e);
                report.tables_failed += 1;
                continue;
            }
        };

        // An unreadable stored table counts as changed.
        let current = config.heating_table(&thermostat.mac).ok();
        if current.as_ref() == Some(&table) {
            report.tables_unchanged += 1;
            continue;
        }

        match config.save_heating_table(&thermostat.mac, &table) {
            Ok(()) => {
                info!("New heating table for {}", thermostat.mac);
                report.tables_updated += 1;
            }
            Err(e) => {
                error!("Could not save heating table for {}: {}", thermostat.mac, e);
                report.tables_failed += 1;
            }
        }
    }

    Ok(report)
}
