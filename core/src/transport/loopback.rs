//! In-process radio linking one initiator to one responder
//!
//! Commands issued on one side surface as events on the other, the way a
//! platform stack would report them. Used by the integration tests and the
//! CLI demo, and handy for exercising failure paths: the radio can be powered
//! off, the link dropped and the outbound queue made to overflow.

use super::abstraction::{
    AdvertisementData, AttResponse, CentralEvent, CentralTransport, DiscoveredCharacteristic,
    DiscoveredService, PeripheralEvent, PeripheralTransport, RadioState, RequestId,
    TransportError, WriteKind,
};
use crate::gatt::{CentralId, CharRef, DescriptorValue, PeerId, ScanFilter, Service};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Default per-subscriber payload bound reported on subscribe
pub const DEFAULT_LOOPBACK_MTU: usize = 182;

const LOOPBACK_RSSI: i16 = -48;

struct Inner {
    radio: RadioState,
    peer_id: PeerId,
    central_id: CentralId,
    central_tx: mpsc::UnboundedSender<CentralEvent>,
    peripheral_tx: mpsc::UnboundedSender<PeripheralEvent>,
    services: Vec<Service>,
    advertising: Option<AdvertisementData>,
    scanning: Option<ScanFilter>,
    connected: bool,
    subscribed: BTreeSet<(Uuid, Uuid)>,
    mtu: usize,
    fail_updates: usize,
    next_request: RequestId,
    pending_reads: HashMap<RequestId, CharRef>,
    pending_writes: HashMap<RequestId, CharRef>,
}

impl Inner {
    fn to_central(&self, event: CentralEvent) {
        trace!("loopback -> initiator: {}", event);
        let _ = self.central_tx.send(event);
    }

    fn to_peripheral(&self, event: PeripheralEvent) {
        trace!("loopback -> responder: {}", event);
        let _ = self.peripheral_tx.send(event);
    }

    fn ready(&self) -> Result<(), TransportError> {
        if self.radio.is_ready() {
            Ok(())
        } else {
            Err(TransportError::Unavailable)
        }
    }

    fn linked(&self, peer: PeerId) -> Result<(), TransportError> {
        self.ready()?;
        if self.connected && peer == self.peer_id {
            Ok(())
        } else {
            Err(TransportError::Rejected(format!("{} not connected", peer)))
        }
    }

    fn advertised_services(&self) -> Option<(Option<String>, Vec<Uuid>)> {
        match &self.advertising {
            Some(AdvertisementData::Services {
                local_name,
                service_uuids,
            }) => Some((local_name.clone(), service_uuids.clone())),
            Some(AdvertisementData::Empty) => Some((None, Vec::new())),
            None => None,
        }
    }

    /// Report the responder to a scanning initiator when both sides are up
    fn announce(&self) {
        let (Some(filter), Some((name, services))) = (&self.scanning, self.advertised_services())
        else {
            return;
        };
        if filter.matches(&services) {
            self.to_central(CentralEvent::PeerDiscovered {
                peer: self.peer_id,
                name,
                rssi: LOOPBACK_RSSI,
                advertised_services: services,
            });
        }
    }

    fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    /// Tear the link down, unsubscribing everything on the responder side
    fn unlink(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.connected = false;
        self.pending_reads.clear();
        self.pending_writes.clear();
        let subscribed = std::mem::take(&mut self.subscribed);
        for (service, characteristic) in subscribed {
            self.to_peripheral(PeripheralEvent::Unsubscribed {
                central: self.central_id,
                characteristic: CharRef::new(service, characteristic),
            });
        }
        true
    }

    fn request_id(&mut self) -> RequestId {
        self.next_request += 1;
        self.next_request
    }
}

/// Shared in-process radio; clone freely, every clone drives the same link
#[derive(Clone)]
pub struct LoopbackRadio {
    inner: Arc<Mutex<Inner>>,
}

impl LoopbackRadio {
    /// A powered-on radio plus the event streams for each role
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<CentralEvent>,
        mpsc::UnboundedReceiver<PeripheralEvent>,
    ) {
        let (central_tx, central_rx) = mpsc::unbounded_channel();
        let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            radio: RadioState::PoweredOn,
            peer_id: PeerId::random(),
            central_id: CentralId::random(),
            central_tx,
            peripheral_tx,
            services: Vec::new(),
            advertising: None,
            scanning: None,
            connected: false,
            subscribed: BTreeSet::new(),
            mtu: DEFAULT_LOOPBACK_MTU,
            fail_updates: 0,
            next_request: 0,
            pending_reads: HashMap::new(),
            pending_writes: HashMap::new(),
        };
        (
            Self {
                inner: Arc::new(Mutex::new(inner)),
            },
            central_rx,
            peripheral_rx,
        )
    }

    /// Identity of the responder as the initiator sees it
    pub fn peer_id(&self) -> PeerId {
        self.inner.lock().peer_id
    }

    /// Identity of the initiator as the responder sees it
    pub fn central_id(&self) -> CentralId {
        self.inner.lock().central_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Power the radio on or off for both roles
    pub fn set_radio_state(&self, state: RadioState) {
        let mut inner = self.inner.lock();
        inner.radio = state;
        inner.to_central(CentralEvent::StateChanged(state));
        inner.to_peripheral(PeripheralEvent::StateChanged(state));
        if !state.is_ready() {
            inner.scanning = None;
            inner.advertising = None;
            inner.unlink();
        }
        debug!("Loopback radio {}", state);
    }

    /// Drop the link as if the peer walked out of range
    pub fn drop_link(&self, error: Option<String>) {
        let mut inner = self.inner.lock();
        if inner.unlink() {
            let peer = inner.peer_id;
            inner.to_central(CentralEvent::Disconnected { peer, error });
        }
    }

    /// Report a full outbound queue for the next `count` pushes
    pub fn fail_next_updates(&self, count: usize) {
        self.inner.lock().fail_updates = count;
    }

    /// Signal that the outbound queue has drained
    pub fn signal_ready_to_update(&self) {
        self.inner
            .lock()
            .to_peripheral(PeripheralEvent::ReadyToUpdateSubscribers);
    }

    /// Payload bound reported for future subscriptions
    pub fn set_max_update_len(&self, mtu: usize) {
        self.inner.lock().mtu = mtu;
    }
}

impl CentralTransport for LoopbackRadio {
    fn radio_state(&self) -> RadioState {
        self.inner.lock().radio
    }

    fn start_scan(&self, filter: &ScanFilter) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.ready()?;
        inner.scanning = Some(filter.clone());
        inner.announce();
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        self.inner.lock().scanning = None;
        Ok(())
    }

    fn connect(&self, peer: PeerId, _auto_reconnect: bool) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.ready()?;
        if peer != inner.peer_id {
            return Err(TransportError::Rejected(format!("unknown peer {}", peer)));
        }
        if inner.advertising.is_none() {
            inner.to_central(CentralEvent::ConnectFailed {
                peer,
                error: "peer is not advertising".to_string(),
            });
            return Ok(());
        }
        inner.connected = true;
        inner.to_central(CentralEvent::Connected { peer });
        Ok(())
    }

    fn cancel_connection(&self, peer: PeerId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if peer == inner.peer_id && inner.unlink() {
            inner.to_central(CentralEvent::Disconnected { peer, error: None });
        }
        Ok(())
    }

    fn discover_services(&self, peer: PeerId, filter: &[Uuid]) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        inner.linked(peer)?;
        let found = inner
            .services
            .iter()
            .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
            .map(|s| DiscoveredService {
                uuid: s.uuid,
                primary: s.primary,
            })
            .collect();
        inner.to_central(CentralEvent::ServicesDiscovered {
            peer,
            result: Ok(found),
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        peer: PeerId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        inner.linked(peer)?;
        let result = match inner.service(&service) {
            Some(svc) => Ok(svc
                .characteristics()
                .iter()
                .filter(|c| filter.is_empty() || filter.contains(&c.uuid))
                .map(|c| DiscoveredCharacteristic {
                    uuid: c.uuid,
                    properties: c.properties.clone(),
                })
                .collect()),
            None => Err(format!("service {} not found", service)),
        };
        inner.to_central(CentralEvent::CharacteristicsDiscovered {
            peer,
            service,
            result,
        });
        Ok(())
    }

    fn discover_descriptors(
        &self,
        peer: PeerId,
        characteristic: CharRef,
    ) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        inner.linked(peer)?;
        let result = inner
            .service(&characteristic.service)
            .and_then(|s| s.characteristic(&characteristic.characteristic))
            .map(|c| c.descriptors.iter().map(|d| d.uuid).collect())
            .ok_or_else(|| format!("characteristic {} not found", characteristic));
        inner.to_central(CentralEvent::DescriptorsDiscovered {
            peer,
            characteristic,
            result,
        });
        Ok(())
    }

    fn read_descriptor(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        descriptor: Uuid,
    ) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        inner.linked(peer)?;
        let result: Result<DescriptorValue, String> = inner
            .service(&characteristic.service)
            .and_then(|s| s.characteristic(&characteristic.characteristic))
            .and_then(|c| c.descriptor(&descriptor))
            .and_then(|d| d.value.clone())
            .ok_or_else(|| format!("descriptor {} has no value", descriptor));
        inner.to_central(CentralEvent::DescriptorValueUpdated {
            peer,
            characteristic,
            descriptor,
            result,
        });
        Ok(())
    }

    fn set_notify(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.linked(peer)?;
        let can_notify = inner
            .service(&characteristic.service)
            .and_then(|s| s.characteristic(&characteristic.characteristic))
            .is_some_and(|c| c.properties.can_notify());
        if !can_notify {
            inner.to_central(CentralEvent::NotificationStateChanged {
                peer,
                characteristic,
                result: Err("notifications not supported".to_string()),
            });
            return Ok(());
        }

        let key = (characteristic.service, characteristic.characteristic);
        let central = inner.central_id;
        if enabled {
            if inner.subscribed.insert(key) {
                let max_update_len = inner.mtu;
                inner.to_peripheral(PeripheralEvent::Subscribed {
                    central,
                    characteristic,
                    max_update_len,
                });
            }
        } else if inner.subscribed.remove(&key) {
            inner.to_peripheral(PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            });
        }
        inner.to_central(CentralEvent::NotificationStateChanged {
            peer,
            characteristic,
            result: Ok(enabled),
        });
        Ok(())
    }

    fn read(&self, peer: PeerId, characteristic: CharRef) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.linked(peer)?;
        let request = inner.request_id();
        inner.pending_reads.insert(request, characteristic);
        let central = inner.central_id;
        inner.to_peripheral(PeripheralEvent::ReadRequest {
            request,
            central,
            characteristic,
            offset: 0,
        });
        Ok(())
    }

    fn write(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.linked(peer)?;
        let request = inner.request_id();
        let response_required = kind == WriteKind::WithResponse;
        if response_required {
            inner.pending_writes.insert(request, characteristic);
        }
        let central = inner.central_id;
        inner.to_peripheral(PeripheralEvent::WriteRequest {
            request,
            central,
            characteristic,
            value: data.to_vec(),
            response_required,
        });
        Ok(())
    }
}

impl PeripheralTransport for LoopbackRadio {
    fn radio_state(&self) -> RadioState {
        self.inner.lock().radio
    }

    fn add_service(&self, service: &Service) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.service(&service.uuid).is_some() {
            return Err(TransportError::Rejected(format!(
                "service {} already registered",
                service.uuid
            )));
        }
        inner.services.push(service.clone());
        inner.to_peripheral(PeripheralEvent::ServiceAdded {
            service: service.uuid,
            error: None,
        });
        Ok(())
    }

    fn remove_service(&self, service: Uuid) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.services.retain(|s| s.uuid != service);
        inner.subscribed.retain(|(svc, _)| *svc != service);
        Ok(())
    }

    fn start_advertising(&self, data: &AdvertisementData) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.ready()?;
        inner.advertising = Some(data.clone());
        inner.to_peripheral(PeripheralEvent::AdvertisingStarted { error: None });
        inner.announce();
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), TransportError> {
        self.inner.lock().advertising = None;
        Ok(())
    }

    fn update_value(
        &self,
        characteristic: CharRef,
        data: &[u8],
        subscribers: &[CentralId],
    ) -> Result<bool, TransportError> {
        let mut inner = self.inner.lock();
        inner.ready()?;
        if inner.fail_updates > 0 {
            inner.fail_updates -= 1;
            return Ok(false);
        }

        let key = (characteristic.service, characteristic.characteristic);
        let addressed = subscribers.is_empty() || subscribers.contains(&inner.central_id);
        if inner.connected && addressed && inner.subscribed.contains(&key) {
            let peer = inner.peer_id;
            inner.to_central(CentralEvent::ValueUpdated {
                peer,
                characteristic,
                result: Ok(data.to_vec()),
            });
        }
        Ok(true)
    }

    fn respond(&self, request: RequestId, response: AttResponse) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let peer = inner.peer_id;

        if let Some(characteristic) = inner.pending_reads.remove(&request) {
            let result = match response {
                AttResponse::Success(value) => Ok(value),
                other => Err(format!("{:?}", other)),
            };
            inner.to_central(CentralEvent::ValueUpdated {
                peer,
                characteristic,
                result,
            });
            return Ok(());
        }
        if let Some(characteristic) = inner.pending_writes.remove(&request) {
            let result = match response {
                AttResponse::Success(_) => Ok(()),
                other => Err(format!("{:?}", other)),
            };
            inner.to_central(CentralEvent::WriteCompleted {
                peer,
                characteristic,
                result,
            });
            return Ok(());
        }
        Err(TransportError::InvalidHandle)
    }
}
