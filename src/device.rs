//! Device, room and gateway snapshots kept by the registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Duty cycle (percent) at which the gateway stops accepting radio commands.
pub const MAX_DUTY_CYCLE: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Cube,
    HeatingThermostat,
    HeatingThermostatPlus,
    WallMountedThermostat,
    ShutterContact,
    EcoSwitch,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Cube => "cube",
            DeviceType::HeatingThermostat => "thermostat",
            DeviceType::HeatingThermostatPlus => "thermostat_plus",
            DeviceType::WallMountedThermostat => "wall_thermostat",
            DeviceType::ShutterContact => "shutter_contact",
            DeviceType::EcoSwitch => "eco_switch",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Devices that accept set point and mode commands.
    pub fn is_thermostat(&self) -> bool {
        matches!(
            self,
            DeviceType::HeatingThermostat
                | DeviceType::HeatingThermostatPlus
                | DeviceType::WallMountedThermostat
        )
    }

    pub fn parse(s: &str) -> DeviceType {
        match s.trim().to_ascii_lowercase().as_str() {
            "cube" => DeviceType::Cube,
            "thermostat" => DeviceType::HeatingThermostat,
            "thermostat_plus" => DeviceType::HeatingThermostatPlus,
            "wall_thermostat" => DeviceType::WallMountedThermostat,
            "shutter_contact" => DeviceType::ShutterContact,
            "eco_switch" => DeviceType::EcoSwitch,
            _ => DeviceType::Unknown,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThermostatMode {
    Automatic,
    Manual,
    Vacation,
    Boost,
}

impl ThermostatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThermostatMode::Automatic => "AUTOMATIC",
            ThermostatMode::Manual => "MANUAL",
            ThermostatMode::Vacation => "VACATION",
            ThermostatMode::Boost => "BOOST",
        }
    }
}

impl fmt::Display for ThermostatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThermostatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTOMATIC" => Ok(ThermostatMode::Automatic),
            "MANUAL" => Ok(ThermostatMode::Manual),
            "VACATION" => Ok(ThermostatMode::Vacation),
            "BOOST" => Ok(ThermostatMode::Boost),
            other => Err(format!("unknown thermostat mode '{}'", other)),
        }
    }
}

/// Last known value of one device attribute.
///
/// `updated` is true when the most recent refresh changed the value (or
/// introduced it), false when the refresh repeated what was already known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub value: String,
    pub updated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Room {
    pub position: u8,
    pub name: String,
}

/// Configuration of a device as announced by `C` and `M` messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceConfig {
    pub serial: String,
    pub rf_address: String,
    pub device_type: DeviceType,
    pub name: String,
    pub room_id: u8,
    pub room_name: String,
    pub properties: BTreeMap<String, String>,
}

impl DeviceConfig {
    pub fn new(serial: impl Into<String>, rf_address: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            serial: serial.into(),
            rf_address: rf_address.into(),
            device_type,
            name: String::new(),
            room_id: 0,
            room_name: String::new(),
            properties: BTreeMap::new(),
        }
    }
}

/// The registry's current view of one physical device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    serial: String,
    rf_address: String,
    device_type: DeviceType,
    name: String,
    room_id: u8,
    room_name: String,
    mode: Option<ThermostatMode>,
    set_point: Option<f64>,
    attributes: BTreeMap<String, Attribute>,
}

impl Device {
    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut device = Self {
            serial: config.serial.clone(),
            rf_address: config.rf_address.clone(),
            device_type: config.device_type,
            name: String::new(),
            room_id: 0,
            room_name: String::new(),
            mode: None,
            set_point: None,
            attributes: BTreeMap::new(),
        };
        device.apply_config(config);
        device
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }
    pub fn rf_address(&self) -> &str {
        &self.rf_address
    }
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn room_id(&self) -> u8 {
        self.room_id
    }
    pub fn room_name(&self) -> &str {
        &self.room_name
    }
    pub fn mode(&self) -> Option<ThermostatMode> {
        self.mode
    }
    pub fn set_point(&self) -> Option<f64> {
        self.set_point
    }
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }
    pub fn attributes(&self) -> &BTreeMap<String, Attribute> {
        &self.attributes
    }

    /// True if any attribute changed during the last refresh.
    pub fn is_updated(&self) -> bool {
        self.attributes.values().any(|a| a.updated)
    }

    pub(crate) fn set_mode(&mut self, mode: ThermostatMode) {
        self.mode = Some(mode);
    }

    pub(crate) fn apply_config(&mut self, config: &DeviceConfig) {
        if !config.name.is_empty() {
            self.name = config.name.clone();
        }
        self.room_id = config.room_id;
        self.room_name = config.room_name.clone();
        if config.device_type != DeviceType::Unknown {
            self.device_type = config.device_type;
        }
        for (key, value) in &config.properties {
            self.set_attribute(key, value);
        }
    }

    /// Applies one status record. Flags are reset first so that `updated`
    /// reflects exactly this record.
    pub(crate) fn apply_status<'a>(&mut self, fields: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for attribute in self.attributes.values_mut() {
            attribute.updated = false;
        }
        for (key, value) in fields {
            match key {
                "mode" => {
                    if let Ok(mode) = value.parse() {
                        self.mode = Some(mode);
                    }
                }
                "setpoint" => {
                    if let Ok(temp) = value.parse() {
                        self.set_point = Some(temp);
                    }
                }
                _ => {}
            }
            self.set_attribute(key, value);
        }
    }

    /// Stores a value; returns whether it differs from the previous one.
    pub(crate) fn set_attribute(&mut self, name: &str, value: &str) -> bool {
        match self.attributes.get_mut(name) {
            Some(existing) => {
                let changed = existing.value != value;
                if changed {
                    existing.value = value.to_string();
                }
                existing.updated = changed;
                changed
            }
            None => {
                self.attributes.insert(
                    name.to_string(),
                    Attribute { value: value.to_string(), updated: true },
                );
                true
            }
        }
    }

    /// Forces every attribute to be reported as refreshed.
    pub(crate) fn mark_all_updated(&mut self) {
        for attribute in self.attributes.values_mut() {
            attribute.updated = true;
        }
    }
}

/// State of the gateway itself, taken from `H`, `S` and `F` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CubeInfo {
    pub serial: String,
    pub rf_address: String,
    pub firmware: String,
    pub duty_cycle: u8,
    pub free_memory_slots: u32,
    pub ntp_servers: Vec<String>,
}

impl CubeInfo {
    pub fn has_excess_duty_cycle(&self) -> bool {
        self.duty_cycle >= MAX_DUTY_CYCLE
    }
}
