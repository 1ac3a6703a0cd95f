//! Per-peer connection session owned by the initiator

use crate::gatt::{CharRef, Characteristic, Service};

/// Everything the initiator tracks about one remote responder beyond its
/// public [`crate::gatt::Peer`] record
#[derive(Debug, Clone, Default)]
pub(crate) struct PeerSession {
    /// Capability tree discovered over the current link
    pub services: Vec<Service>,
    /// Human-readable strings read from descriptors, first-seen order
    pub descriptions: Vec<String>,
    /// Discovery commands issued but not yet answered
    pub pending: u32,
    /// Set by an explicit cancel; suppresses reconnect on the next disconnect
    pub cancel_requested: bool,
    /// Reconnect attempts spent in the current outage
    pub reconnect_attempts: u32,
    /// A backoff timer is armed for this peer
    pub reconnect_pending: bool,
    /// Bumped on every connect attempt so stale timeouts are ignored
    pub connect_generation: u64,
    /// A timed-out attempt was cancelled and its failure report has not
    /// arrived yet
    pub abandoned_attempt: bool,
    /// Connected automatically because the peer advertised the protocol service
    pub auto_connected: bool,
    /// Link was up when the radio went away
    pub interrupted: bool,
}

impl PeerSession {
    pub fn begin(&mut self) {
        self.pending += 1;
    }

    /// Mark one discovery command answered; true once nothing is outstanding
    pub fn finish(&mut self) -> bool {
        self.pending = self.pending.saturating_sub(1);
        self.pending == 0
    }

    /// Forget the tree of a previous link
    pub fn reset_tree(&mut self) {
        self.services.clear();
        self.pending = 0;
    }

    pub fn service_mut(&mut self, uuid: &uuid::Uuid) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| &s.uuid == uuid)
    }

    pub fn characteristic(&self, at: &CharRef) -> Option<&Characteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == at.service)
            .and_then(|s| s.characteristic(&at.characteristic))
    }

    pub fn characteristic_mut(&mut self, at: &CharRef) -> Option<&mut Characteristic> {
        self.service_mut(&at.service)
            .and_then(|s| s.characteristic_mut(&at.characteristic))
    }

    /// Characteristics currently delivering notifications
    pub fn notifying(&self) -> Vec<CharRef> {
        self.services
            .iter()
            .flat_map(|s| {
                s.characteristics()
                    .iter()
                    .filter(|c| c.notifying)
                    .map(move |c| CharRef::new(s.uuid, c.uuid))
            })
            .collect()
    }

    pub fn clear_notifying(&mut self) {
        for service in &mut self.services {
            if let Some(chars) = service.characteristics.as_mut() {
                for c in chars {
                    c.notifying = false;
                }
            }
        }
    }

    pub fn record_description(&mut self, text: &str) {
        if !self.descriptions.iter().any(|d| d == text) {
            self.descriptions.push(text.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{Property, TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID};

    fn session_with_target() -> PeerSession {
        let mut session = PeerSession::default();
        session.services.push(Service::new(
            TARGET_SERVICE_UUID,
            true,
            vec![Characteristic::new(TARGET_CHARACTERISTIC_UUID, [Property::Notify])],
        ));
        session
    }

    #[test]
    fn test_pending_counter() {
        let mut session = PeerSession::default();
        session.begin();
        session.begin();
        assert!(!session.finish());
        assert!(session.finish());
        // Never underflows
        assert!(session.finish());
    }

    #[test]
    fn test_notifying_tracking() {
        let mut session = session_with_target();
        let at = CharRef::new(TARGET_SERVICE_UUID, TARGET_CHARACTERISTIC_UUID);
        assert!(session.notifying().is_empty());

        session.characteristic_mut(&at).expect("present").notifying = true;
        assert_eq!(session.notifying(), vec![at]);

        session.clear_notifying();
        assert!(session.notifying().is_empty());
    }

    #[test]
    fn test_descriptions_deduplicated() {
        let mut session = PeerSession::default();
        session.record_description("Need a ride");
        session.record_description("Need a ride");
        session.record_description("Lost dog");
        assert_eq!(session.descriptions, vec!["Need a ride", "Lost dog"]);
    }

    #[test]
    fn test_reset_tree() {
        let mut session = session_with_target();
        session.begin();
        session.reset_tree();
        assert!(session.services.is_empty());
        assert_eq!(session.pending, 0);
    }
}
