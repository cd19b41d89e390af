//! In-memory model of the gateway's devices, rooms and own state.
//!
//! Single writer: the session mutates the registry while dispatching
//! messages under its lock; the client only removes devices through the
//! explicit removal operations. Any task may read at any time and gets
//! cloned snapshots. One message's update to a device is applied under one
//! write lock, so readers never see half of it.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::{CubeInfo, Device, DeviceConfig, Room, ThermostatMode};
use crate::error::{CubeError, Result};

#[derive(Debug, Default)]
struct RegistryState {
    devices: Vec<Device>,
    configurations: Vec<DeviceConfig>,
    rooms: Vec<Room>,
    cube: CubeInfo,
}

impl RegistryState {
    fn device_index(&self, serial: &str) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.serial().eq_ignore_ascii_case(serial))
    }

    fn configuration_index(&self, serial: &str) -> Option<usize> {
        self.configurations
            .iter()
            .position(|c| c.serial.eq_ignore_ascii_case(serial))
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        let state = self.read();
        state.device_index(serial).map(|i| state.devices[i].clone())
    }

    /// All known devices in order of first sighting.
    pub fn devices(&self) -> Vec<Device> {
        self.read().devices.clone()
    }

    pub fn configuration(&self, serial: &str) -> Option<DeviceConfig> {
        let state = self.read();
        state
            .configuration_index(serial)
            .map(|i| state.configurations[i].clone())
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.read().rooms.clone()
    }

    pub fn room_name(&self, position: u8) -> Option<String> {
        self.read()
            .rooms
            .iter()
            .find(|r| r.position == position)
            .map(|r| r.name.clone())
    }

    pub fn cube(&self) -> CubeInfo {
        self.read().cube.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.read().devices.is_empty()
    }

    pub(crate) fn update_cube<R>(&self, f: impl FnOnce(&mut CubeInfo) -> R) -> R {
        f(&mut self.write().cube)
    }

    /// Replaces the room table as a whole.
    pub(crate) fn replace_rooms(&self, rooms: Vec<Room>) {
        self.write().rooms = rooms;
    }

    /// Drops any configuration for the same serial and stores `config`.
    pub(crate) fn replace_configuration(&self, config: DeviceConfig) {
        let mut state = self.write();
        if let Some(i) = state.configuration_index(&config.serial) {
            state.configurations.remove(i);
        }
        state.configurations.push(config);
    }

    /// Stores a configuration update. An existing configuration is replaced
    /// and its device, if any, takes over the new values; the updated
    /// device is returned. A first configuration is only recorded.
    pub(crate) fn update_configuration(&self, config: DeviceConfig) -> Option<Device> {
        let mut guard = self.write();
        let state = &mut *guard;
        match state.configuration_index(&config.serial) {
            None => {
                state.configurations.push(config);
                None
            }
            Some(i) => {
                let device = state.device_index(&config.serial).map(|d| {
                    state.devices[d].apply_config(&config);
                    state.devices[d].clone()
                });
                state.configurations[i] = config;
                device
            }
        }
    }

    /// Applies one device-list record to the device with `rf_address`,
    /// creating the device from its configuration on first sighting.
    pub(crate) fn apply_status<'a>(
        &self,
        rf_address: &str,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;
        let index = match state
            .devices
            .iter()
            .position(|d| d.rf_address().eq_ignore_ascii_case(rf_address))
        {
            Some(i) => i,
            None => {
                let config = state
                    .configurations
                    .iter()
                    .find(|c| c.rf_address.eq_ignore_ascii_case(rf_address))
                    .ok_or_else(|| {
                        CubeError::Protocol(format!(
                            "status for unknown rf address {}",
                            rf_address
                        ))
                    })?;
                let device = Device::from_config(config);
                tracing::debug!(serial = device.serial(), rf = rf_address, "New device listed");
                state.devices.push(device);
                state.devices.len() - 1
            }
        };
        state.devices[index].apply_status(fields);
        Ok(())
    }

    pub(crate) fn set_mode(&self, serial: &str, mode: ThermostatMode) {
        let mut state = self.write();
        if let Some(i) = state.device_index(serial) {
            state.devices[i].set_mode(mode);
        }
    }

    /// Marks every attribute of the device as refreshed and returns it.
    pub(crate) fn mark_all_updated(&self, serial: &str) -> Option<Device> {
        let mut state = self.write();
        let i = state.device_index(serial)?;
        state.devices[i].mark_all_updated();
        Some(state.devices[i].clone())
    }

    /// Removes the device and its configuration.
    pub fn remove_device(&self, serial: &str) -> Option<Device> {
        let mut state = self.write();
        if let Some(i) = state.configuration_index(serial) {
            state.configurations.remove(i);
        }
        let i = state.device_index(serial)?;
        Some(state.devices.remove(i))
    }

    /// Forgets all devices and configurations. Rooms and gateway state stay.
    pub fn clear_devices(&self) -> Vec<Device> {
        let mut state = self.write();
        state.configurations.clear();
        std::mem::take(&mut state.devices)
    }
}
