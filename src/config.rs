use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tracing::{info, warn};

use crate::error::{Result, StationError};

/// USB-serial bridge fitted to the breathalyzer
const ADAPTER_VENDOR: &str = "Silicon Labs";

/// Where the serial port name comes from. Read at session start and on every
/// reconnect attempt.
pub trait PortSource: Send + Sync {
    fn current_port(&self) -> Result<String>;
}

impl PortSource for String {
    fn current_port(&self) -> Result<String> {
        Ok(self.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub serial_port: Option<String>,
}

/// JSON-backed settings file, e.g. `resources/config.json`
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the settings, writing a default file first if none exists
    pub fn load(&self) -> Result<StationConfig> {
        if !self.path.exists() {
            info!("Configuration file {} not found, creating it", self.path.display());
            self.store(&StationConfig::default())?;
            return Ok(StationConfig::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save_port(&self, port: &str) -> Result<()> {
        let mut config = self.load()?;
        config.serial_port = Some(port.to_string());
        self.store(&config)?;
        info!("Serial port {} saved to {}", port, self.path.display());
        Ok(())
    }

    fn store(&self, config: &StationConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }
}

impl PortSource for ConfigStore {
    fn current_port(&self) -> Result<String> {
        match self.load()?.serial_port {
            Some(port) if !port.trim().is_empty() => Ok(port.trim().to_string()),
            _ => Err(StationError::ConfigError(format!(
                "No serial port configured in {}",
                self.path.display()
            ))),
        }
    }
}

/// A serial port visible to the operating system
#[derive(Debug, Clone, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| PortInfo {
            description: describe(&port.port_type),
            name: port.port_name,
        })
        .collect())
}

/// Finds the first port whose USB adapter identifies as the breathalyzer's bridge
pub fn discover_port() -> Result<Option<String>> {
    let found = list_ports()?
        .into_iter()
        .find(|port| port.description.contains(ADAPTER_VENDOR))
        .map(|port| port.name);
    match &found {
        Some(name) => info!("Detected breathalyzer adapter on {}", name),
        None => warn!("No {} adapter found among serial ports", ADAPTER_VENDOR),
    }
    Ok(found)
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let parts: Vec<&str> = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                parts.join(" ")
            }
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "Unknown".to_string(),
    }
}
