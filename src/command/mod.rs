//! Outbound commands: payloads, target keys and the pending-command queue.

mod queue;

pub use queue::CommandQueue;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{Device, ThermostatMode};
use crate::error::{CubeError, Result};

/// Set point sent when a thermostat is switched off.
pub const DEFAULT_OFF_TEMPERATURE: f64 = 4.5;
/// Set point sent when a thermostat is switched fully on.
pub const DEFAULT_ON_TEMPERATURE: f64 = 30.5;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Protocol-level requests understood by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum CubeCommand {
    /// Request the device list
    ListDevices,
    /// Request the configuration of one device
    RequestConfig { rf_address: String },
    /// Query (empty list) or update the NTP servers
    Ntp { servers: Vec<String> },
    /// Change set point and mode of a thermostat
    SetPoint {
        rf_address: String,
        room_id: u8,
        mode: ThermostatMode,
        temperature: f64,
    },
    /// Remove a device from the gateway
    DeleteDevice { rf_address: String, force: bool },
    /// Put the gateway in inclusion (pairing) mode
    Inclusion,
    /// Ask the gateway to reload its data; it answers by closing
    Reload,
    /// Wipe the gateway configuration
    ResetConfig,
}

impl CubeCommand {
    /// Stable name used in target keys.
    pub fn class_name(&self) -> &'static str {
        match self {
            CubeCommand::ListDevices => "list",
            CubeCommand::RequestConfig { .. } => "config",
            CubeCommand::Ntp { .. } => "ntp",
            CubeCommand::SetPoint { .. } => "setpoint",
            CubeCommand::DeleteDevice { .. } => "delete",
            CubeCommand::Inclusion => "inclusion",
            CubeCommand::Reload => "reload",
            CubeCommand::ResetConfig => "reset",
        }
    }

    /// Prefix of the line that ends the gateway's answer, if one is expected.
    pub fn terminator(&self) -> Option<&'static str> {
        match self {
            CubeCommand::ListDevices => Some("L:"),
            CubeCommand::RequestConfig { .. } => Some("C:"),
            CubeCommand::Ntp { .. } => Some("F:"),
            CubeCommand::SetPoint { .. } => Some("S:"),
            CubeCommand::DeleteDevice { .. } => Some("A:"),
            CubeCommand::Inclusion => Some("N:"),
            CubeCommand::Reload => None,
            CubeCommand::ResetConfig => Some("A:"),
        }
    }

    /// The gateway volunteers the answer to this command right after a
    /// connection opens, so the handshake read already serves it.
    pub fn is_answered_by_handshake(&self) -> bool {
        matches!(self, CubeCommand::ListDevices)
    }
}

/// A user-facing change to one device channel, translated into a
/// [`CubeCommand`] against the device's state at send time.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    SetTemperature(f64),
    SetTemperatureOn,
    SetTemperatureOff,
    SetMode(ThermostatMode),
}

impl ChannelCommand {
    pub fn channel(&self) -> &'static str {
        match self {
            ChannelCommand::SetTemperature(_)
            | ChannelCommand::SetTemperatureOn
            | ChannelCommand::SetTemperatureOff => "set_temp",
            ChannelCommand::SetMode(_) => "mode",
        }
    }

    /// Builds the protocol command for `device`. Returns the command and,
    /// for mode changes, the mode the device should be recorded in.
    pub fn resolve(&self, device: &Device) -> Result<(CubeCommand, Option<ThermostatMode>)> {
        if !device.device_type().is_thermostat() {
            return Err(CubeError::Protocol(format!(
                "device {} ({}) does not accept {} commands",
                device.serial(),
                device.device_type(),
                self.channel()
            )));
        }
        let set_point = |mode: ThermostatMode, temperature: f64| CubeCommand::SetPoint {
            rf_address: device.rf_address().to_string(),
            room_id: device.room_id(),
            mode,
            temperature,
        };
        let current_mode = device.mode().unwrap_or(ThermostatMode::Manual);

        let resolved = match self {
            ChannelCommand::SetTemperature(t) => (set_point(current_mode, round_half_up(*t)), None),
            ChannelCommand::SetTemperatureOn => (set_point(current_mode, DEFAULT_ON_TEMPERATURE), None),
            ChannelCommand::SetTemperatureOff => {
                (set_point(current_mode, DEFAULT_OFF_TEMPERATURE), None)
            }
            ChannelCommand::SetMode(ThermostatMode::Automatic) => {
                (set_point(ThermostatMode::Automatic, 0.0), Some(ThermostatMode::Automatic))
            }
            ChannelCommand::SetMode(mode @ (ThermostatMode::Boost | ThermostatMode::Manual)) => {
                let temperature = device.set_point().unwrap_or(0.0);
                (set_point(*mode, temperature), Some(*mode))
            }
            ChannelCommand::SetMode(ThermostatMode::Vacation) => {
                return Err(CubeError::Protocol(
                    "only AUTOMATIC, BOOST and MANUAL can be set from a channel".into(),
                ));
            }
        };
        Ok(resolved)
    }
}

fn round_half_up(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Cube(CubeCommand),
    Channel(ChannelCommand),
}

impl From<CubeCommand> for Payload {
    fn from(c: CubeCommand) -> Self {
        Payload::Cube(c)
    }
}

impl From<ChannelCommand> for Payload {
    fn from(c: ChannelCommand) -> Self {
        Payload::Channel(c)
    }
}

/// What a command is about. Two commands with equal keys are
/// interchangeable: the newer one makes the older one pointless.
///
/// Rendered as `subject-class`, e.g. `KEQ0565026-set_temp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    subject: String,
    class: String,
}

impl TargetKey {
    /// Key for a change to one channel of a device.
    pub fn channel(serial: impl Into<String>, channel: impl Into<String>) -> Self {
        Self { subject: serial.into(), class: channel.into() }
    }

    /// Key for a protocol-level command.
    pub fn protocol(subject: impl Into<String>, command: &CubeCommand) -> Self {
        Self { subject: subject.into(), class: command.class_name().to_string() }
    }

    pub fn for_payload(subject: impl Into<String>, payload: &Payload) -> Self {
        match payload {
            Payload::Cube(c) => Self::protocol(subject, c),
            Payload::Channel(c) => Self::channel(subject, c.channel()),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn class(&self) -> &str {
        &self.class
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.subject, self.class)
    }
}

/// A pending outbound request. Never mutated; a newer command with the
/// same key replaces it in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    id: u64,
    target_key: TargetKey,
    payload: Payload,
    description: String,
}

impl Command {
    /// `subject` is the device serial, or the hub id for gateway commands.
    pub fn new(subject: impl Into<String>, payload: impl Into<Payload>, description: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            target_key: TargetKey::for_payload(subject, &payload),
            payload,
            description: description.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn target_key(&self) -> &TargetKey {
        &self.target_key
    }
    pub fn payload(&self) -> &Payload {
        &self.payload
    }
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} ({})", self.id, self.target_key, self.description)
    }
}
