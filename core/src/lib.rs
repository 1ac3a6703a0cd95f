// Nearlink Core: wireless peer discovery and exchange
//
// Two coordinators share one capability model. The initiator scans, connects
// and walks a responder's services; the responder publishes services,
// advertises them and answers requests. Neither touches the radio directly:
// commands go out through the transport traits and results come back as
// events on the coordinator's own loop.

pub mod config;
pub mod dedupe;
pub mod error;
pub mod gatt;
pub mod initiator;
pub mod reconnect;
pub mod responder;
pub mod restore;
pub mod schedule;
pub mod transport;

pub use config::{ConfigError, InitiatorConfig, NearlinkConfig, ProtocolIds, ResponderConfig};
pub use error::{CoordinatorError, FaultOrigin, TransientError};
pub use gatt::{
    CentralId, CharRef, Characteristic, ConnectionState, Descriptor, DescriptorValue,
    DiscoveryPhase, Peer, PeerId, Permission, Property, ScanFilter, Service,
    TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID,
};
pub use initiator::{
    spawn_initiator, InitiatorCommand, InitiatorCoordinator, InitiatorHandle, InitiatorView,
    RemoteRequest,
};
pub use responder::{
    spawn_responder, ResponderCommand, ResponderCoordinator, ResponderHandle, ResponderView,
};
pub use restore::{
    RestorationSnapshot, RestoreError, RestoredCentral, RestoredPeripheral, RestoredSubscription,
};

// ============================================================================
// LOGGING
// ============================================================================

/// Install a stderr fmt subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default_directive: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Short hex rendering of a payload for log lines
pub(crate) fn preview(data: &[u8]) -> String {
    const PREVIEW_BYTES: usize = 8;
    let head = &data[..data.len().min(PREVIEW_BYTES)];
    if data.len() > PREVIEW_BYTES {
        format!("{}..", hex::encode(head))
    } else {
        hex::encode(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(b""), "");
        assert_eq!(preview(&[0xAB, 0x01]), "ab01");
        assert_eq!(preview(&[0u8; 12]), "0000000000000000..");
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging("nearlink_core=debug");
        init_logging("nearlink_core=trace");
    }
}
