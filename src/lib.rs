#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod backup;
pub mod client;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod framer;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use backup::{BackupJournal, BackupRecord, BackupState};
pub use client::{GatewayClient, INCLUSION_TIMEOUT, REFRESH_EXPIRY};
pub use command::{ChannelCommand, Command, CommandQueue, CubeCommand, Payload, TargetKey};
pub use config::GatewayConfig;
pub use device::{CubeInfo, Device, DeviceConfig, DeviceType, Room, ThermostatMode};
pub use error::{CubeError, Result};
pub use framer::LineFramer;
pub use listener::{DeviceStatusListener, HubInfo, ListenerError, ListenerResult};
pub use protocol::{Message, MessageCodec, MessageType, ParseError, TextCodec};
pub use registry::DeviceRegistry;
pub use session::{BoxStream, ConnectionState, Connector, Exchange, GatewaySession, GatewayStream, TcpConnector};
