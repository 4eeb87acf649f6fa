//! Thermostat list and heating tables.
//!
//! The directory server decides which thermostats belong to this gateway and
//! what their weekly schedules are. `refresh` copies that into a local JSON
//! document so cycles keep working while the server is unreachable:
//!
//! ```json
//! {
//!   "thermostat_macs": ["2e:ff:ff:00:22:8b"],
//!   "heating_tables": {
//!     "2e:ff:ff:00:22:8b": [{ "day": 0, "time": "06:30", "temperature": 21.0 }]
//!   }
//! }
//! ```
//!
//! Each table is validated when it is read, so one malformed schedule only
//! affects its own thermostat.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use smartheat_types::HeatingTable;

/// Result type for thermostat configuration access.
pub type Result<T> = std::result::Result<T, ThermostatsError>;

/// Errors reading or writing the thermostat configuration.
#[derive(Debug, thiserror::Error)]
pub enum ThermostatsError {
    #[error("Failed to read thermostat config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse thermostat config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write thermostat config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize thermostat config: {0}")]
    Serialize(serde_json::Error),
    #[error("Invalid heating table for {mac}: {source}")]
    InvalidTable {
        mac: String,
        source: serde_json::Error,
    },
}

/// Read and write access to the thermostat list and heating tables.
pub trait ThermostatConfig: Send + Sync {
    /// Configured thermostat MACs, or `None` if none were ever saved.
    fn thermostat_macs(&self) -> Result<Option<Vec<String>>>;

    /// The heating table of `mac`; empty if none is stored.
    fn heating_table(&self, mac: &str) -> Result<HeatingTable>;

    /// Replace the thermostat list.
    fn save_thermostat_macs(&self, macs: &[String]) -> Result<()>;

    /// Replace the heating table of `mac`.
    fn save_heating_table(&self, mac: &str, table: &HeatingTable) -> Result<()>;
}

/// On-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    thermostat_macs: Option<Vec<String>>,
    #[serde(default)]
    heating_tables: BTreeMap<String, serde_json::Value>,
}

impl Document {
    fn heating_table(&self, mac: &str) -> Result<HeatingTable> {
        match self.heating_tables.get(mac) {
            None => Ok(HeatingTable::empty()),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|e| ThermostatsError::InvalidTable {
                    mac: mac.to_string(),
                    source: e,
                })
            }
        }
    }

    fn set_heating_table(&mut self, mac: &str, table: &HeatingTable) -> Result<()> {
        let value = serde_json::to_value(table).map_err(ThermostatsError::Serialize)?;
        self.heating_tables.insert(mac.to_string(), value);
        Ok(())
    }
}

/// Thermostat configuration stored as a JSON file.
///
/// The file is re-read on every access. Writes go to a temporary file in
/// the same directory which then replaces the original, so readers see
/// either the old or the new document.
pub struct FileThermostatConfig {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileThermostatConfig {
    /// Use the document at `path`. A missing file reads as empty.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Document> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::default()),
            Err(e) => {
                return Err(ThermostatsError::Read {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };

        serde_json::from_str(&content).map_err(|e| ThermostatsError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }

    fn store(&self, document: &Document) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(document).map_err(ThermostatsError::Serialize)?;
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ThermostatsError::Write { path, source }
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err(&dir))?;

        let mut tmp_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "thermostats.json".into());
        tmp_name.push(".tmp");
        let tmp = dir.join(tmp_name);

        {
            let mut file = std::fs::File::create(&tmp).map_err(write_err(&tmp))?;
            file.write_all(&content).map_err(write_err(&tmp))?;
            file.sync_all().map_err(write_err(&tmp))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(write_err(&self.path))?;

        debug!("Wrote thermostat config {}", self.path.display());
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut Document) -> Result<()>) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.load()?;
        change(&mut document)?;
        self.store(&document)
    }
}

impl ThermostatConfig for FileThermostatConfig {
    fn thermostat_macs(&self) -> Result<Option<Vec<String>>> {
        Ok(self.load()?.thermostat_macs)
    }

    fn heating_table(&self, mac: &str) -> Result<HeatingTable> {
        self.load()?.heating_table(mac)
    }

    fn save_thermostat_macs(&self, macs: &[String]) -> Result<()> {
        self.update(|document| {
            document.thermostat_macs = Some(macs.to_vec());
            Ok(())
        })
    }

    fn save_heating_table(&self, mac: &str, table: &HeatingTable) -> Result<()> {
        self.update(|document| document.set_heating_table(mac, table))
    }
}

/// Thermostat configuration held in memory.
#[derive(Default)]
pub struct MemoryThermostatConfig {
    document: RwLock<Document>,
}

impl MemoryThermostatConfig {
    /// An empty configuration (no thermostat list saved).
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration listing `macs`.
    pub fn with_thermostats<I, S>(macs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let document = Document {
            thermostat_macs: Some(macs.into_iter().map(Into::into).collect()),
            heating_tables: BTreeMap::new(),
        };
        Self {
            document: RwLock::new(document),
        }
    }

    /// Store a raw JSON heating table, bypassing validation.
    pub fn insert_raw_table(&self, mac: &str, value: serde_json::Value) {
        self.document
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .heating_tables
            .insert(mac.to_string(), value);
    }
}

impl ThermostatConfig for MemoryThermostatConfig {
    fn thermostat_macs(&self) -> Result<Option<Vec<String>>> {
        let document = self.document.read().unwrap_or_else(PoisonError::into_inner);
        Ok(document.thermostat_macs.clone())
    }

    fn heating_table(&self, mac: &str) -> Result<HeatingTable> {
        let document = self.document.read().unwrap_or_else(PoisonError::into_inner);
        document.heating_table(mac)
    }

    fn save_thermostat_macs(&self, macs: &[String]) -> Result<()> {
        let mut document = self.document.write().unwrap_or_else(PoisonError::into_inner);
        document.thermostat_macs = Some(macs.to_vec());
        Ok(())
    }

    fn save_heating_table(&self, mac: &str, table: &HeatingTable) -> Result<()> {
        let mut document = self.document.write().unwrap_or_else(PoisonError::into_inner);
        document.set_heating_table(mac, table)
    }
}
