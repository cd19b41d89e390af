use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backup::BackupState;
use crate::command::{Command, CommandQueue, CubeCommand, Payload};
use crate::config::GatewayConfig;
use crate::device::{CubeInfo, Device, Room, ThermostatMode};
use crate::dispatch::Dispatcher;
use crate::error::{CubeError, Result};
use crate::listener::{DeviceStatusListener, HubInfo, ListenerSet, OnFailure};
use crate::protocol::{MessageCodec, TextCodec};
use crate::registry::DeviceRegistry;
use crate::scheduler::PeriodicTasks;
use crate::session::{ConnectionState, Connector, Exchange, GatewaySession, TcpConnector};

/// How long the gateway may take to report a device in inclusion mode.
pub const INCLUSION_TIMEOUT: Duration = Duration::from_secs(80);

/// A user-triggered refresh is skipped when the last one is this recent.
pub const REFRESH_EXPIRY: Duration = Duration::from_secs(10);

struct ClientInner {
    config: GatewayConfig,
    hub: HubInfo,
    session: GatewaySession,
    registry: Arc<DeviceRegistry>,
    queue: Arc<CommandQueue>,
    listeners: Arc<ListenerSet>,
    previous_online: AtomicBool,
    /// Sequence number of the newest exchange whose outcome was applied.
    last_outcome: Mutex<u64>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_wake: Arc<Notify>,
    tasks: Mutex<Option<PeriodicTasks>>,
}

/// Public face of one gateway.
///
/// Cheap to clone; all clones share the same connection, queue, registry
/// and listeners. Two periodic tasks drive the I/O once [`start`] is
/// called: a device list refresh and a queue flush.
///
/// [`start`]: GatewayClient::start
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl GatewayClient {
    /// Client talking TCP to `config.host:config.port`.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::from_config(&config));
        Self::with_connector(config, connector, Box::new(TextCodec::new()))
    }

    /// Client over an injected transport and codec.
    pub fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        codec: Box<dyn MessageCodec>,
    ) -> Result<Self> {
        config.validate()?;
        let hub = HubInfo { hub_id: config.hub_id.clone(), address: connector.address() };
        let registry = Arc::new(DeviceRegistry::new());
        let queue = Arc::new(CommandQueue::new(config.queue_capacity));
        let listeners = Arc::new(ListenerSet::new());
        let dispatcher = Dispatcher::new(
            hub.clone(),
            config.exclusive,
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&listeners),
        );
        let session = GatewaySession::new(&config, connector, codec, dispatcher, Arc::clone(&registry));
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                hub,
                session,
                registry,
                queue,
                listeners,
                // Optimistic, so a failing first refresh reports the loss.
                previous_online: AtomicBool::new(true),
                last_outcome: Mutex::new(0),
                last_refresh: Mutex::new(None),
                refresh_wake: Arc::new(Notify::new()),
                tasks: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &HubInfo {
        &self.inner.hub
    }

    /// Starts the refresh and flush tasks. Returns false if already running.
    ///
    /// With a backup directory configured, the first state dump is saved.
    pub async fn start(&self) -> bool {
        if self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return false;
        }
        if self.inner.config.backup_directory.is_some() {
            if let Err(e) = self.inner.session.request_backup().await {
                tracing::warn!(error = %e, "Backup not requested");
            }
        }

        let mut slot = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        let mut tasks = PeriodicTasks::new();
        let weak = Arc::downgrade(&self.inner);
        tasks.spawn(
            "refresh",
            self.inner.config.refresh_interval(),
            Some(Arc::clone(&self.inner.refresh_wake)),
            move || {
                let client = upgrade(&weak);
                async move {
                    if let Some(client) = client {
                        client.refresh().await;
                    }
                }
            },
        );
        let weak = Arc::downgrade(&self.inner);
        tasks.spawn("flush", self.inner.config.flush_interval(), None, move || {
            let client = upgrade(&weak);
            async move {
                if let Some(client) = client {
                    client.flush_once().await;
                }
            }
        });
        *slot = Some(tasks);
        tracing::info!(hub = %self.inner.hub.hub_id, address = %self.inner.hub.address, "Gateway client started");
        true
    }

    /// Stops the periodic tasks, closes the connection and waits for
    /// pending backups.
    pub async fn stop(&self) {
        let tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        self.inner.session.close().await;
        if let Err(e) = self.inner.session.flush_backups().await {
            tracing::warn!(error = %e, "Backup writer unavailable");
        }
        tracing::info!(hub = %self.inner.hub.hub_id, "Gateway client stopped");
    }

    /// Requests the device list and reports every listed device to the
    /// listeners. Returns whether the gateway answered.
    pub async fn refresh(&self) -> bool {
        let exchange = self
            .inner
            .session
            .exchange(&CubeCommand::ListDevices, self.inner.config.io_timeout())
            .await;
        *self.inner.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.record_outcome(exchange);
        if exchange.ok {
            self.report_devices();
        }
        exchange.ok
    }

    /// Refreshes unless the last refresh finished less than
    /// [`REFRESH_EXPIRY`] ago. Returns whether a refresh ran.
    pub async fn refresh_if_stale(&self) -> bool {
        let fresh = self
            .inner
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(false, |at| at.elapsed() < REFRESH_EXPIRY);
        if fresh {
            tracing::debug!(hub = %self.inner.hub.hub_id, "Skipping refresh, device list is recent");
            return false;
        }
        self.refresh().await;
        true
    }

    /// Asks the refresh task for an immediate refresh.
    pub fn request_refresh(&self) {
        self.inner.refresh_wake.notify_one();
    }

    /// One flush tick: sends the oldest queued command, if any.
    ///
    /// While the gateway reports an excessive duty cycle nothing is sent and
    /// the connection is closed. Returns whether a command was delivered.
    pub async fn flush_once(&self) -> bool {
        if self.inner.registry.cube().has_excess_duty_cycle() {
            tracing::debug!(hub = %self.inner.hub.hub_id, "Duty cycle exceeded, holding queued commands");
            self.inner.session.close().await;
            return false;
        }
        let Some(command) = self.inner.queue.poll() else {
            return false;
        };
        let (cube_command, mode) = match self.resolve(&command) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "Dropping command");
                return false;
            }
        };
        let timeout = match cube_command {
            CubeCommand::Inclusion => INCLUSION_TIMEOUT,
            _ => self.inner.config.io_timeout(),
        };
        tracing::debug!(command = %command, "Sending queued command");
        let exchange = self.inner.session.exchange(&cube_command, timeout).await;
        if exchange.ok {
            if let Some(mode) = mode {
                self.inner.registry.set_mode(command.target_key().subject(), mode);
            }
        } else {
            tracing::debug!(command = %command, "Error sending command to gateway");
        }
        self.record_outcome(exchange);
        exchange.ok
    }

    fn resolve(&self, command: &Command) -> Result<(CubeCommand, Option<ThermostatMode>)> {
        match command.payload() {
            Payload::Cube(cube) => Ok((cube.clone(), None)),
            Payload::Channel(channel) => {
                let serial = command.target_key().subject();
                let device = self
                    .inner
                    .registry
                    .device(serial)
                    .ok_or_else(|| CubeError::Protocol(format!("unknown device {}", serial)))?;
                channel.resolve(&device)
            }
        }
    }

    /// Queues a command for the flush task. Never blocks; a full queue
    /// drops the command with a log line.
    pub fn queue_command(&self, subject: impl Into<String>, payload: impl Into<Payload>, description: impl Into<String>) {
        self.queue(Command::new(subject, payload, description));
    }

    /// Returns whether the command was accepted.
    pub fn queue(&self, command: Command) -> bool {
        self.inner.queue.enqueue(command)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Registers a listener; the first one triggers an immediate refresh.
    /// Returns false if it was already registered.
    pub fn register_listener(&self, listener: Arc<dyn DeviceStatusListener>) -> bool {
        let first = self.inner.listeners.is_empty();
        let added = self.inner.listeners.register(listener);
        if added && first {
            self.request_refresh();
        }
        added
    }

    /// Unregisters a listener. Devices are reported as discovered again on
    /// the next refresh.
    pub fn unregister_listener(&self, listener: &Arc<dyn DeviceStatusListener>) -> bool {
        self.inner.listeners.unregister(listener)
    }

    /// False after a failed exchange until the next successful one.
    pub fn is_online(&self) -> bool {
        self.inner.previous_online.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    /// Exchanges completed on the current connection.
    pub fn request_count(&self) -> u32 {
        self.inner.session.request_count()
    }

    /// Puts the gateway in pairing mode and waits up to
    /// [`INCLUSION_TIMEOUT`] for a new device.
    pub async fn start_inclusion(&self) -> bool {
        tracing::info!(hub = %self.inner.hub.hub_id, "Starting inclusion mode");
        let exchange = self.inner.session.exchange(&CubeCommand::Inclusion, INCLUSION_TIMEOUT).await;
        self.record_outcome(exchange);
        exchange.ok
    }

    /// Queues removal of a device from the gateway followed by a reload,
    /// and forgets the device locally. Returns false for unknown serials.
    pub fn delete_device(&self, serial: &str) -> bool {
        let Some(device) = self.inner.registry.device(serial) else {
            tracing::warn!(serial, "Cannot delete unknown device");
            return false;
        };
        self.queue_command(
            device.serial(),
            CubeCommand::DeleteDevice { rf_address: device.rf_address().to_string(), force: true },
            "Delete device from cube",
        );
        self.inner.registry.remove_device(device.serial());
        self.inner.listeners.forget_reported(device.serial());
        self.inner.listeners.notify("removed", OnFailure::Unregister, |l| {
            l.on_device_removed(&self.inner.hub, &device)
        });
        self.queue_command(self.inner.hub.hub_id.as_str(), CubeCommand::Reload, "Reload cube data");
        true
    }

    /// Queues a factory reset of the gateway configuration and reports every
    /// known device as removed.
    pub fn reset_config(&self) {
        self.queue_command(self.inner.hub.hub_id.as_str(), CubeCommand::ResetConfig, "Reset cube configuration");
        for device in self.inner.registry.clear_devices() {
            self.inner.listeners.notify("removed", OnFailure::Unregister, |l| {
                l.on_device_removed(&self.inner.hub, &device)
            });
        }
        self.inner.listeners.forget_all_reported();
    }

    /// Queues an update of the gateway's NTP servers.
    pub fn update_ntp_servers(&self, servers: Vec<String>) {
        self.queue_command(self.inner.hub.hub_id.as_str(), CubeCommand::Ntp { servers }, "Update NTP info");
    }

    /// Captures the gateway's next state dump to the backup directory.
    pub async fn backup(&self) -> Result<()> {
        self.inner.session.request_backup().await
    }

    pub async fn backup_state(&self) -> BackupState {
        self.inner.session.backup_state().await
    }

    /// Waits until captured backups are on disk.
    pub async fn flush_backups(&self) -> Result<()> {
        self.inner.session.flush_backups().await
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.inner.registry.device(serial)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.registry.devices()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.inner.registry.rooms()
    }

    pub fn cube_info(&self) -> CubeInfo {
        self.inner.registry.cube()
    }

    fn report_devices(&self) {
        let hub = &self.inner.hub;
        let listeners = &self.inner.listeners;
        for device in self.inner.registry.devices() {
            if listeners.was_reported(device.serial()) {
                listeners.notify("changed", OnFailure::Unregister, |l| {
                    l.on_device_changed(&hub.hub_id, &device)
                });
                continue;
            }

            // New since the last loss or reset: discovery first, then a full update.
            let listening = !listeners.is_empty();
            listeners.notify("discovered", OnFailure::Log, |l| l.on_device_discovered(hub, &device));
            let device = self.inner.registry.mark_all_updated(device.serial()).unwrap_or(device);
            listeners.notify("changed", OnFailure::Log, |l| l.on_device_changed(&hub.hub_id, &device));
            if listening {
                listeners.mark_reported(device.serial());
            }
        }
    }

    /// Applies the online/offline transition of an exchange unless a newer
    /// exchange already reported in.
    fn record_outcome(&self, exchange: Exchange) {
        let mut last = self.inner.last_outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if exchange.seq <= *last {
            tracing::trace!(seq = exchange.seq, newest = *last, "Ignoring outcome of an older exchange");
            return;
        }
        *last = exchange.seq;
        if exchange.ok {
            self.mark_online();
        } else {
            self.mark_offline();
        }
    }

    fn mark_online(&self) {
        if !self.inner.previous_online.swap(true, Ordering::AcqRel) {
            tracing::debug!(hub = %self.inner.hub.hub_id, "Gateway connected");
            self.inner
                .listeners
                .broadcast("connection", |l| l.on_connection(&self.inner.hub));
        }
    }

    fn mark_offline(&self) {
        if self.inner.previous_online.swap(false, Ordering::AcqRel) {
            tracing::debug!(hub = %self.inner.hub.hub_id, "Gateway connection lost");
            self.inner.listeners.forget_all_reported();
            self.inner
                .listeners
                .broadcast("connection_lost", |l| l.on_connection_lost(&self.inner.hub));
        }
    }
}

fn upgrade(weak: &Weak<ClientInner>) -> Option<GatewayClient> {
    weak.upgrade().map(|inner| GatewayClient { inner })
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("hub", &self.inner.hub)
            .field("session", &self.inner.session)
            .field("queue_len", &self.inner.queue.len())
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}
