//! Transport capability abstraction for the coordinator pair
//!
//! The platform radio stack is consumed through two narrow command traits.
//! Commands return immediately; their outcomes arrive later as events on the
//! owning coordinator's event channel.

use crate::gatt::{CentralId, CharRef, DescriptorValue, PeerId, ScanFilter, Service};
use crate::restore::{RestoredCentral, RestoredPeripheral};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Platform identifier for an inbound ATT request awaiting a response
pub type RequestId = u64;

/// Power/authorization state of the local radio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_ready(&self) -> bool {
        *self == RadioState::PoweredOn
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Unknown => write!(f, "Unknown"),
            RadioState::Resetting => write!(f, "Resetting"),
            RadioState::Unsupported => write!(f, "Unsupported"),
            RadioState::Unauthorized => write!(f, "Unauthorized"),
            RadioState::PoweredOff => write!(f, "PoweredOff"),
            RadioState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Write acknowledgement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Responder answer to an inbound read/write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttResponse {
    Success(Vec<u8>),
    InvalidOffset,
    AttributeNotFound,
    ReadNotPermitted,
    WriteNotPermitted,
}

/// Advertisement payload requested by the responder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisementData {
    #[default]
    Empty,
    Services {
        local_name: Option<String>,
        service_uuids: Vec<Uuid>,
    },
}

/// Immediate failure of a transport command
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Radio not powered on")]
    Unavailable,
    #[error("Platform handle missing")]
    InvalidHandle,
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Initiator-side radio commands
#[cfg_attr(test, mockall::automock)]
pub trait CentralTransport: Send + Sync {
    fn radio_state(&self) -> RadioState;

    fn start_scan(&self, filter: &ScanFilter) -> Result<(), TransportError>;

    fn stop_scan(&self) -> Result<(), TransportError>;

    /// `auto_reconnect` asks the platform to keep the link alive on its own
    fn connect(&self, peer: PeerId, auto_reconnect: bool) -> Result<(), TransportError>;

    fn cancel_connection(&self, peer: PeerId) -> Result<(), TransportError>;

    /// An empty filter enumerates every service
    fn discover_services(&self, peer: PeerId, filter: &[Uuid]) -> Result<(), TransportError>;

    fn discover_characteristics(
        &self,
        peer: PeerId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<(), TransportError>;

    fn discover_descriptors(&self, peer: PeerId, characteristic: CharRef)
        -> Result<(), TransportError>;

    fn read_descriptor(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        descriptor: Uuid,
    ) -> Result<(), TransportError>;

    fn set_notify(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn read(&self, peer: PeerId, characteristic: CharRef) -> Result<(), TransportError>;

    fn write(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;
}

/// Responder-side radio commands
#[cfg_attr(test, mockall::automock)]
pub trait PeripheralTransport: Send + Sync {
    fn radio_state(&self) -> RadioState;

    fn add_service(&self, service: &Service) -> Result<(), TransportError>;

    fn remove_service(&self, service: Uuid) -> Result<(), TransportError>;

    fn start_advertising(&self, data: &AdvertisementData) -> Result<(), TransportError>;

    fn stop_advertising(&self) -> Result<(), TransportError>;

    /// Push a value to subscribers; an empty subscriber list means all of them.
    /// `Ok(false)` reports a full outbound queue.
    fn update_value(
        &self,
        characteristic: CharRef,
        data: &[u8],
        subscribers: &[CentralId],
    ) -> Result<bool, TransportError>;

    fn respond(&self, request: RequestId, response: AttResponse) -> Result<(), TransportError>;
}

/// Service as reported by remote discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub primary: bool,
}

/// Characteristic as reported by remote discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: crate::gatt::Properties,
}

/// Asynchronous results delivered to the initiator
#[derive(Debug, Clone)]
pub enum CentralEvent {
    StateChanged(RadioState),
    PeerDiscovered {
        peer: PeerId,
        name: Option<String>,
        rssi: i16,
        advertised_services: Vec<Uuid>,
    },
    Connected {
        peer: PeerId,
    },
    ConnectFailed {
        peer: PeerId,
        error: String,
    },
    Disconnected {
        peer: PeerId,
        error: Option<String>,
    },
    ServicesDiscovered {
        peer: PeerId,
        result: Result<Vec<DiscoveredService>, String>,
    },
    CharacteristicsDiscovered {
        peer: PeerId,
        service: Uuid,
        result: Result<Vec<DiscoveredCharacteristic>, String>,
    },
    DescriptorsDiscovered {
        peer: PeerId,
        characteristic: CharRef,
        result: Result<Vec<Uuid>, String>,
    },
    DescriptorValueUpdated {
        peer: PeerId,
        characteristic: CharRef,
        descriptor: Uuid,
        result: Result<DescriptorValue, String>,
    },
    ValueUpdated {
        peer: PeerId,
        characteristic: CharRef,
        result: Result<Vec<u8>, String>,
    },
    WriteCompleted {
        peer: PeerId,
        characteristic: CharRef,
        result: Result<(), String>,
    },
    NotificationStateChanged {
        peer: PeerId,
        characteristic: CharRef,
        result: Result<bool, String>,
    },
    WillRestore(RestoredCentral),
}

impl fmt::Display for CentralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralEvent::StateChanged(state) => write!(f, "StateChanged({})", state),
            CentralEvent::PeerDiscovered { peer, rssi, .. } => {
                write!(f, "PeerDiscovered {{ peer: {}, rssi: {} }}", peer, rssi)
            }
            CentralEvent::Connected { peer } => write!(f, "Connected {{ peer: {} }}", peer),
            CentralEvent::ConnectFailed { peer, error } => {
                write!(f, "ConnectFailed {{ peer: {}, error: {} }}", peer, error)
            }
            CentralEvent::Disconnected { peer, error } => {
                write!(f, "Disconnected {{ peer: {}, error: {:?} }}", peer, error)
            }
            CentralEvent::ServicesDiscovered { peer, result } => write!(
                f,
                "ServicesDiscovered {{ peer: {}, count: {:?} }}",
                peer,
                result.as_ref().map(|s| s.len())
            ),
            CentralEvent::CharacteristicsDiscovered { peer, service, result } => write!(
                f,
                "CharacteristicsDiscovered {{ peer: {}, service: {}, count: {:?} }}",
                peer,
                service,
                result.as_ref().map(|c| c.len())
            ),
            CentralEvent::DescriptorsDiscovered { peer, characteristic, .. } => write!(
                f,
                "DescriptorsDiscovered {{ peer: {}, characteristic: {} }}",
                peer, characteristic
            ),
            CentralEvent::DescriptorValueUpdated { peer, descriptor, .. } => write!(
                f,
                "DescriptorValueUpdated {{ peer: {}, descriptor: {} }}",
                peer, descriptor
            ),
            CentralEvent::ValueUpdated { peer, characteristic, result } => write!(
                f,
                "ValueUpdated {{ peer: {}, characteristic: {}, len: {:?} }}",
                peer,
                characteristic,
                result.as_ref().map(|v| v.len())
            ),
            CentralEvent::WriteCompleted { peer, characteristic, .. } => write!(
                f,
                "WriteCompleted {{ peer: {}, characteristic: {} }}",
                peer, characteristic
            ),
            CentralEvent::NotificationStateChanged { peer, characteristic, .. } => write!(
                f,
                "NotificationStateChanged {{ peer: {}, characteristic: {} }}",
                peer, characteristic
            ),
            CentralEvent::WillRestore(_) => write!(f, "WillRestore"),
        }
    }
}

/// Asynchronous results and inbound requests delivered to the responder
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    StateChanged(RadioState),
    ServiceAdded {
        service: Uuid,
        error: Option<String>,
    },
    AdvertisingStarted {
        error: Option<String>,
    },
    Subscribed {
        central: CentralId,
        characteristic: CharRef,
        max_update_len: usize,
    },
    Unsubscribed {
        central: CentralId,
        characteristic: CharRef,
    },
    ReadRequest {
        request: RequestId,
        central: CentralId,
        characteristic: CharRef,
        offset: usize,
    },
    WriteRequest {
        request: RequestId,
        central: CentralId,
        characteristic: CharRef,
        value: Vec<u8>,
        response_required: bool,
    },
    ReadyToUpdateSubscribers,
    WillRestore(RestoredPeripheral),
}

impl fmt::Display for PeripheralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralEvent::StateChanged(state) => write!(f, "StateChanged({})", state),
            PeripheralEvent::ServiceAdded { service, error } => {
                write!(f, "ServiceAdded {{ service: {}, error: {:?} }}", service, error)
            }
            PeripheralEvent::AdvertisingStarted { error } => {
                write!(f, "AdvertisingStarted {{ error: {:?} }}", error)
            }
            PeripheralEvent::Subscribed { central, characteristic, max_update_len } => write!(
                f,
                "Subscribed {{ central: {}, characteristic: {}, max_update_len: {} }}",
                central, characteristic, max_update_len
            ),
            PeripheralEvent::Unsubscribed { central, characteristic } => write!(
                f,
                "Unsubscribed {{ central: {}, characteristic: {} }}",
                central, characteristic
            ),
            PeripheralEvent::ReadRequest { request, characteristic, offset, .. } => write!(
                f,
                "ReadRequest {{ request: {}, characteristic: {}, offset: {} }}",
                request, characteristic, offset
            ),
            PeripheralEvent::WriteRequest { request, characteristic, value, .. } => write!(
                f,
                "WriteRequest {{ request: {}, characteristic: {}, len: {} }}",
                request,
                characteristic,
                value.len()
            ),
            PeripheralEvent::ReadyToUpdateSubscribers => write!(f, "ReadyToUpdateSubscribers"),
            PeripheralEvent::WillRestore(_) => write!(f, "WillRestore"),
        }
    }
}
