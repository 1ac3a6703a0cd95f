//! Coordinator fault taxonomy and auto-expiring error state
//!
//! Faults never tear down a coordinator. Every fault path records exactly one
//! [`TransientError`] in the coordinator's [`ErrorSlot`]; observers decide
//! visibility by comparing the expiry against their own clock.

use crate::gatt::{CharRef, PeerId};
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Default lifetime of a UI-visible fault
pub const DEFAULT_TRANSIENT_ERROR_TTL: Duration = Duration::from_secs(2);

/// Where a fault originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// Radio not ready or platform handle missing
    Precondition,
    /// Rejected locally before reaching the transport
    Legality,
    /// Reported asynchronously by the transport
    Transport,
    /// Not a certain failure; caller may retry
    Advisory,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    // Preconditions
    #[error("Radio transport unavailable")]
    TransportUnavailable,
    #[error("Platform transport handle is gone")]
    InvalidCoordinator,
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Unknown service {0}")]
    UnknownService(Uuid),
    #[error("Unknown characteristic {0}")]
    UnknownCharacteristic(CharRef),
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),

    // Protocol legality
    #[error("Characteristic {0} carries a static value but is not read-only")]
    PropertiesMismatch(Uuid),
    #[error("Characteristic {0} requests a property local services cannot host")]
    UnsupportedProperty(Uuid),
    #[error("Included service {0} is not published")]
    IncludedServiceNotPublished(Uuid),
    #[error("Service {0} already published")]
    ServiceExists(Uuid),
    #[error("Service {0} is included by another published service")]
    ServiceInUse(Uuid),
    #[error("Service {0} is not published")]
    ServiceNotFound(Uuid),
    #[error("No services to advertise")]
    NoServicesToAdvertise,
    #[error("Payload of {len} bytes exceeds maximum update length {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Characteristic {0} is not mutable")]
    CharacteristicNotMutable(Uuid),
    #[error("Characteristic does not support the requested write type")]
    WriteTypeMismatch,

    // Transport-reported
    #[error("Scan failed: {0}")]
    ScanError(String),
    #[error("Connect failed: {0}")]
    ConnectError(String),
    #[error("Disconnect error: {0}")]
    DisconnectError(String),
    #[error("Service discovery failed: {0}")]
    DiscoverServicesError(String),
    #[error("Characteristic discovery failed: {0}")]
    DiscoverCharacteristicsError(String),
    #[error("Descriptor discovery failed: {0}")]
    DiscoverDescriptorError(String),
    #[error("Descriptor value update failed: {0}")]
    UpdateDescriptorError(String),
    #[error("Read failed: {0}")]
    ReadError(String),
    #[error("Write failed: {0}")]
    WriteError(String),
    #[error("Notification state change failed: {0}")]
    NotifyError(String),
    #[error("Add service failed: {0}")]
    AddServiceError(String),
    #[error("Remove service failed: {0}")]
    RemoveServiceError(String),
    #[error("Advertising failed: {0}")]
    AdvertiseError(String),
    #[error("Peer {0} unreachable after reconnect attempts")]
    Unreachable(PeerId),

    // Advisory
    #[error("Unacknowledged write not confirmed")]
    WriteUnconfirmed,
    #[error("Value update not sent; outbound queue full")]
    UpdateFailed,
    #[error("Characteristic does not support notifications")]
    NotifyUnsupported,
}

impl CoordinatorError {
    pub fn origin(&self) -> FaultOrigin {
        use CoordinatorError::*;
        match self {
            TransportUnavailable
            | InvalidCoordinator
            | UnknownPeer(_)
            | UnknownService(_)
            | UnknownCharacteristic(_)
            | NotConnected(_) => FaultOrigin::Precondition,
            PropertiesMismatch(_)
            | UnsupportedProperty(_)
            | IncludedServiceNotPublished(_)
            | ServiceExists(_)
            | ServiceInUse(_)
            | ServiceNotFound(_)
            | NoServicesToAdvertise
            | PayloadTooLarge { .. }
            | CharacteristicNotMutable(_)
            | WriteTypeMismatch => FaultOrigin::Legality,
            ScanError(_)
            | ConnectError(_)
            | DisconnectError(_)
            | DiscoverServicesError(_)
            | DiscoverCharacteristicsError(_)
            | DiscoverDescriptorError(_)
            | UpdateDescriptorError(_)
            | ReadError(_)
            | WriteError(_)
            | NotifyError(_)
            | AddServiceError(_)
            | RemoveServiceError(_)
            | AdvertiseError(_)
            | Unreachable(_) => FaultOrigin::Transport,
            WriteUnconfirmed | UpdateFailed | NotifyUnsupported => FaultOrigin::Advisory,
        }
    }

    /// Advisory faults do not imply the operation failed
    pub fn is_advisory(&self) -> bool {
        self.origin() == FaultOrigin::Advisory
    }

    /// Lift a transport command failure, tagging rejections with operation context
    pub fn from_transport(err: TransportError, context: fn(String) -> CoordinatorError) -> Self {
        match err {
            TransportError::Unavailable => CoordinatorError::TransportUnavailable,
            TransportError::InvalidHandle => CoordinatorError::InvalidCoordinator,
            TransportError::Rejected(reason) => context(reason),
        }
    }
}

/// A UI-visible fault with an explicit expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientError {
    pub error: CoordinatorError,
    pub raised_at: Instant,
    pub expires_at: Instant,
}

impl TransientError {
    pub fn new(error: CoordinatorError, raised_at: Instant, ttl: Duration) -> Self {
        Self {
            error,
            raised_at,
            expires_at: raised_at + ttl,
        }
    }

    /// Whether an observer at `now` should still display this fault
    pub fn is_active(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Most recent transient error plus a count of every fault raised
#[derive(Debug, Clone)]
pub struct ErrorSlot {
    current: Option<TransientError>,
    ttl: Duration,
    raised: u64,
}

impl ErrorSlot {
    pub fn new(ttl: Duration) -> Self {
        Self {
            current: None,
            ttl,
            raised: 0,
        }
    }

    pub fn raise(&mut self, error: CoordinatorError, now: Instant) -> &TransientError {
        self.raised += 1;
        self.current.insert(TransientError::new(error, now, self.ttl))
    }

    /// Latest fault regardless of expiry
    pub fn latest(&self) -> Option<&TransientError> {
        self.current.as_ref()
    }

    /// Latest fault if still within its display window
    pub fn active(&self, now: Instant) -> Option<&TransientError> {
        self.current.as_ref().filter(|e| e.is_active(now))
    }

    /// Total number of faults raised since construction
    pub fn raised(&self) -> u64 {
        self.raised
    }
}

impl Default for ErrorSlot {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_ERROR_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_error_expires_after_ttl() {
        let now = Instant::now();
        let err = TransientError::new(CoordinatorError::UpdateFailed, now, Duration::from_secs(2));

        assert!(err.is_active(now));
        assert!(err.is_active(now + Duration::from_millis(1999)));
        assert!(!err.is_active(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_error_slot_counts_every_raise() {
        let mut slot = ErrorSlot::default();
        let now = Instant::now();

        slot.raise(CoordinatorError::TransportUnavailable, now);
        slot.raise(CoordinatorError::WriteUnconfirmed, now);

        assert_eq!(slot.raised(), 2);
        assert_eq!(
            slot.latest().map(|e| e.error.clone()),
            Some(CoordinatorError::WriteUnconfirmed)
        );
    }

    #[test]
    fn test_error_slot_active_window() {
        let mut slot = ErrorSlot::new(Duration::from_secs(2));
        let now = Instant::now();
        slot.raise(CoordinatorError::NotifyUnsupported, now);

        assert!(slot.active(now + Duration::from_secs(1)).is_some());
        assert!(slot.active(now + Duration::from_secs(3)).is_none());
        // Expired faults stay inspectable
        assert!(slot.latest().is_some());
    }

    #[test]
    fn test_fault_origins() {
        assert_eq!(
            CoordinatorError::TransportUnavailable.origin(),
            FaultOrigin::Precondition
        );
        assert_eq!(
            CoordinatorError::ServiceInUse(Uuid::nil()).origin(),
            FaultOrigin::Legality
        );
        assert_eq!(
            CoordinatorError::ConnectError("x".into()).origin(),
            FaultOrigin::Transport
        );
        assert!(CoordinatorError::WriteUnconfirmed.is_advisory());
        assert!(!CoordinatorError::PayloadTooLarge { len: 21, max: 20 }.is_advisory());
    }

    #[test]
    fn test_from_transport_mapping() {
        assert_eq!(
            CoordinatorError::from_transport(
                TransportError::Unavailable,
                CoordinatorError::ConnectError
            ),
            CoordinatorError::TransportUnavailable
        );
        assert_eq!(
            CoordinatorError::from_transport(
                TransportError::InvalidHandle,
                CoordinatorError::ConnectError
            ),
            CoordinatorError::InvalidCoordinator
        );
        assert_eq!(
            CoordinatorError::from_transport(
                TransportError::Rejected("busy".into()),
                CoordinatorError::ReadError
            ),
            CoordinatorError::ReadError("busy".into())
        );
    }
}
