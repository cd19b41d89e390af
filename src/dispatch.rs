//! Applies decoded gateway messages to the registry.
//!
//! Property keys understood per message type:
//!
//! | type | keys |
//! |------|------|
//! | `H`  | `serial`, `rf`, `firmware`, `duty`, `slots` |
//! | `S`  | `duty`, `slots`, `discarded` |
//! | `C`  | `serial`, `rf`, `type`, `name`, `room`, anything else is a device property |
//! | `L`  | one record per device, each starting with `rf` |
//! | `M`  | room records (`room_id`, `room_name`) then device records (`serial`, `rf`, `type`, `name`, `room`) |
//! | `N`  | `serial`, `rf`, `type` |
//! | `F`  | `ntp` (repeated) |

use std::sync::Arc;

use crate::command::{Command, CommandQueue, CubeCommand};
use crate::device::{DeviceConfig, DeviceType, Room};
use crate::error::{CubeError, Result};
use crate::listener::{HubInfo, ListenerSet, OnFailure};
use crate::protocol::{Message, MessageType};
use crate::registry::DeviceRegistry;

const CONFIG_KEYS: [&str; 5] = ["serial", "rf", "type", "name", "room"];

/// Routes messages to per-type handlers. Owned by the session and only
/// used while its lock is held.
#[derive(Debug)]
pub struct Dispatcher {
    hub: HubInfo,
    exclusive: bool,
    registry: Arc<DeviceRegistry>,
    queue: Arc<CommandQueue>,
    listeners: Arc<ListenerSet>,
    properties_set: bool,
}

impl Dispatcher {
    pub fn new(
        hub: HubInfo,
        exclusive: bool,
        registry: Arc<DeviceRegistry>,
        queue: Arc<CommandQueue>,
        listeners: Arc<ListenerSet>,
    ) -> Self {
        Self { hub, exclusive, registry, queue, listeners, properties_set: false }
    }

    /// Applies one message. A failing handler only skips its own update.
    pub fn dispatch(&mut self, message: &Message) {
        tracing::trace!(kind = %message.kind(), raw = message.raw(), "Dispatching message");
        let outcome = match message.kind() {
            MessageType::Ack => Ok(()),
            MessageType::Configuration => self.on_configuration(message),
            MessageType::Ntp => {
                self.on_ntp(message);
                Ok(())
            }
            MessageType::Hello => {
                self.on_hello(message);
                Ok(())
            }
            MessageType::DeviceList => self.on_device_list(message),
            MessageType::Metadata => {
                self.on_metadata(message);
                Ok(())
            }
            MessageType::NewDevice => {
                self.on_new_device(message);
                Ok(())
            }
            MessageType::SendResult => {
                self.on_send_result(message);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(kind = %message.kind(), error = %e, "Skipped message update");
        }
    }

    fn on_hello(&mut self, message: &Message) {
        let duty = parse_or(message.get("duty"), 0u8);
        let slots = parse_or(message.get("slots"), 0u32);
        let first = !self.properties_set;
        self.registry.update_cube(|cube| {
            if cube.duty_cycle != duty || cube.free_memory_slots != slots {
                cube.duty_cycle = duty;
                cube.free_memory_slots = slots;
                tracing::debug!(duty_cycle = duty, free_slots = slots, "Cube state changed");
            }
            if first {
                cube.serial = message.get("serial").unwrap_or_default().to_string();
                cube.rf_address = message.get("rf").unwrap_or_default().to_string();
                cube.firmware = message.get("firmware").unwrap_or_default().to_string();
            }
        });
        if first {
            self.properties_set = true;
            self.queue.enqueue(Command::new(
                self.hub.hub_id.as_str(),
                CubeCommand::Ntp { servers: Vec::new() },
                "Request NTP info",
            ));
        }
    }

    fn on_send_result(&self, message: &Message) {
        let duty = parse_or(message.get("duty"), 0u8);
        let slots = parse_or(message.get("slots"), 0u32);
        self.registry.update_cube(|cube| {
            cube.duty_cycle = duty;
            cube.free_memory_slots = slots;
        });
        if message.get("discarded") == Some("1") {
            tracing::warn!(duty_cycle = duty, free_slots = slots, "Last send command discarded");
        } else {
            tracing::debug!(duty_cycle = duty, free_slots = slots, "Send result");
        }
    }

    fn on_configuration(&self, message: &Message) -> Result<()> {
        let pairs = message.properties().iter().map(|(k, v)| (k.as_str(), v.as_str()));
        let mut config = config_from_fields(pairs)?;
        if config.room_id != 0 {
            config.room_name = self.registry.room_name(config.room_id).unwrap_or_default();
        }
        let serial = config.serial.clone();
        let updated = self.registry.update_configuration(config);
        if updated.is_some() {
            tracing::debug!(serial = %serial, "Configuration merged into device");
        }
        if self.exclusive {
            if let Some(device) = self.registry.device(&serial) {
                self.listeners.notify("config_updated", OnFailure::Unregister, |l| {
                    l.on_device_config_updated(&self.hub, &device)
                });
            }
        }
        Ok(())
    }

    fn on_device_list(&self, message: &Message) -> Result<()> {
        let mut first_error = None;
        for record in message.records(&["rf"]) {
            let rf_address = record[0].1;
            let fields = record.iter().skip(1).copied();
            if let Err(e) = self.registry.apply_status(rf_address, fields) {
                tracing::warn!(rf = rf_address, error = %e, "Skipping device list record");
                first_error.get_or_insert(e);
            }
        }
        tracing::trace!(devices = self.registry.devices().len(), "Device list applied");
        match first_error {
            // Already logged per record.
            Some(CubeError::Protocol(_)) | None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn on_metadata(&self, message: &Message) {
        let records = message.records(&["room_id", "serial"]);
        if records.is_empty() {
            tracing::info!(address = %self.hub.address, "No rooms information found, configure the cube");
        }
        let mut rooms = Vec::new();
        let mut devices = Vec::new();
        for record in &records {
            match record[0].0 {
                "room_id" => {
                    let position = parse_or(Some(record[0].1), 0u8);
                    let name = lookup(record, "room_name").unwrap_or_default().to_string();
                    rooms.push(Room { position, name });
                }
                _ => match config_from_fields(record.iter().copied()) {
                    Ok(config) => devices.push(config),
                    Err(e) => tracing::warn!(error = %e, "Skipping metadata device"),
                },
            }
        }
        for mut config in devices {
            config.room_name = rooms
                .iter()
                .find(|r| r.position == config.room_id)
                .map(|r| r.name.clone())
                .unwrap_or_default();
            self.registry.replace_configuration(config);
        }
        self.registry.replace_rooms(rooms);
    }

    fn on_new_device(&self, message: &Message) {
        let rf_address = message.get("rf").unwrap_or_default();
        if rf_address.is_empty() {
            return;
        }
        let serial = message.get("serial").unwrap_or_default();
        tracing::debug!(
            serial = %serial,
            rf = %rf_address,
            device_type = %DeviceType::parse(message.get("type").unwrap_or_default()),
            "New device found"
        );
        self.queue.enqueue(Command::new(
            serial,
            CubeCommand::RequestConfig { rf_address: rf_address.to_string() },
            format!("Refresh {}", serial),
        ));
    }

    fn on_ntp(&self, message: &Message) {
        let servers: Vec<String> = message
            .properties()
            .iter()
            .filter(|(k, _)| k == "ntp")
            .map(|(_, v)| v.clone())
            .collect();
        tracing::debug!(servers = ?servers, "NTP servers");
        self.registry.update_cube(|cube| cube.ntp_servers = servers);
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<&str>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn lookup<'a>(record: &[(&str, &'a str)], key: &str) -> Option<&'a str> {
    record.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn config_from_fields<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<DeviceConfig> {
    let fields: Vec<(&str, &str)> = fields.into_iter().collect();
    let serial = lookup(&fields, "serial").filter(|s| !s.is_empty());
    let rf_address = lookup(&fields, "rf").filter(|s| !s.is_empty());
    let (serial, rf_address) = match (serial, rf_address) {
        (Some(s), Some(rf)) => (s, rf),
        _ => return Err(CubeError::Protocol("device configuration without serial or rf address".into())),
    };
    let device_type = DeviceType::parse(lookup(&fields, "type").unwrap_or_default());
    let mut config = DeviceConfig::new(serial, rf_address, device_type);
    config.name = lookup(&fields, "name").unwrap_or_default().to_string();
    config.room_id = parse_or(lookup(&fields, "room"), 0u8);
    for (key, value) in fields {
        if !CONFIG_KEYS.contains(&key) {
            config.properties.insert(key.to_string(), value.to_string());
        }
    }
    Ok(config)
}
