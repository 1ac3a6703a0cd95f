// Transport module: radio command traits, their events, and the loopback radio

pub mod abstraction;
pub mod loopback;

pub use abstraction::{
    AdvertisementData, AttResponse, CentralEvent, CentralTransport, DiscoveredCharacteristic,
    DiscoveredService, PeripheralEvent, PeripheralTransport, RadioState, RequestId,
    TransportError, WriteKind,
};
pub use loopback::{LoopbackRadio, DEFAULT_LOOPBACK_MTU};

#[cfg(test)]
pub use abstraction::{MockCentralTransport, MockPeripheralTransport};
