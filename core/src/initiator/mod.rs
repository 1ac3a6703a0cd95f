//! Initiator coordinator
//!
//! Owns scanning, the discovered-peer list and one connection state machine
//! per peer. Drives capability discovery down to descriptor values, services
//! read/write/notify commands, deduplicates remote textual requests and
//! recovers from unexpected disconnects with bounded backoff.
//!
//! The coordinator is a synchronous state machine. Commands and transport
//! events mutate it directly; anything that has to happen later is queued as a
//! [`Deferred`] timer for the runtime loop in [`handle`] to arm.

pub mod handle;
mod session;

pub use handle::{spawn_initiator, InitiatorCommand, InitiatorHandle};

use crate::config::{InitiatorConfig, ProtocolIds};
use crate::dedupe::DedupeWindow;
use crate::error::{CoordinatorError, ErrorSlot, TransientError};
use crate::gatt::{
    CharRef, Characteristic, ConnectionState, Descriptor, DescriptorValue, DiscoveryPhase, Peer,
    PeerId, Properties, Property, ScanFilter, Service,
};
use crate::preview;
use crate::restore::RestoredCentral;
use crate::schedule::Deferred;
use crate::transport::{
    CentralEvent, CentralTransport, DiscoveredCharacteristic, DiscoveredService, RadioState,
    TransportError, WriteKind,
};
use session::PeerSession;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A remote textual request that survived deduplication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub peer: PeerId,
    pub text: String,
}

/// Work the initiator asked to be woken up for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorTimer {
    /// Backoff elapsed; try the peer again
    Reconnect { peer: PeerId },
    /// Give up on a connection attempt that never completed
    ConnectTimeout { peer: PeerId, generation: u64 },
    /// Poll the cached value after an unacknowledged write
    VerifyWrite {
        peer: PeerId,
        characteristic: CharRef,
        expected: Vec<u8>,
        attempt: u32,
    },
}

/// Snapshot of everything the UI layer may observe
#[derive(Debug, Clone)]
pub struct InitiatorView {
    pub radio: RadioState,
    pub scanning: bool,
    pub filter: Option<ScanFilter>,
    /// Discovered peers in insertion order
    pub peers: Vec<Peer>,
    /// Connected peers not being cancelled
    pub usable: Vec<PeerId>,
    pub trees: HashMap<PeerId, Vec<Service>>,
    pub descriptions: HashMap<PeerId, Vec<String>>,
    pub error: Option<TransientError>,
    pub errors_raised: u64,
}

impl InitiatorView {
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// The latest fault, if it has not yet expired at `now`
    pub fn active_error(&self, now: Instant) -> Option<&TransientError> {
        self.error.as_ref().filter(|e| e.is_active(now))
    }
}

pub struct InitiatorCoordinator {
    config: InitiatorConfig,
    protocol: ProtocolIds,
    transport: Arc<dyn CentralTransport>,
    radio: RadioState,
    scanning: bool,
    filter: Option<ScanFilter>,
    peers: Vec<Peer>,
    sessions: HashMap<PeerId, PeerSession>,
    usable: HashSet<PeerId>,
    dedupe: DedupeWindow,
    errors: ErrorSlot,
    requests: Option<mpsc::UnboundedSender<RemoteRequest>>,
    deferred: Vec<Deferred<InitiatorTimer>>,
}

impl InitiatorCoordinator {
    pub fn new(
        config: InitiatorConfig,
        protocol: ProtocolIds,
        transport: Arc<dyn CentralTransport>,
    ) -> Self {
        let radio = transport.radio_state();
        Self {
            dedupe: DedupeWindow::new(config.dedupe_ttl()),
            errors: ErrorSlot::new(config.transient_error_ttl()),
            config,
            protocol,
            transport,
            radio,
            scanning: false,
            filter: None,
            peers: Vec::new(),
            sessions: HashMap::new(),
            usable: HashSet::new(),
            requests: None,
            deferred: Vec::new(),
        }
    }

    /// Deliver non-duplicate remote requests to `sink`
    pub fn with_request_sink(mut self, sink: mpsc::UnboundedSender<RemoteRequest>) -> Self {
        self.requests = Some(sink);
        self
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn filter(&self) -> Option<&ScanFilter> {
        self.filter.as_ref()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn is_usable(&self, id: PeerId) -> bool {
        self.usable.contains(&id)
    }

    pub fn services(&self, id: PeerId) -> &[Service] {
        self.sessions
            .get(&id)
            .map(|s| s.services.as_slice())
            .unwrap_or(&[])
    }

    pub fn characteristic(&self, id: PeerId, at: CharRef) -> Option<&Characteristic> {
        self.sessions.get(&id).and_then(|s| s.characteristic(&at))
    }

    pub fn descriptions(&self, id: PeerId) -> &[String] {
        self.sessions
            .get(&id)
            .map(|s| s.descriptions.as_slice())
            .unwrap_or(&[])
    }

    pub fn errors(&self) -> &ErrorSlot {
        &self.errors
    }

    /// Drain timers queued since the last call
    pub fn take_deferred(&mut self) -> Vec<Deferred<InitiatorTimer>> {
        std::mem::take(&mut self.deferred)
    }

    pub fn view(&self) -> InitiatorView {
        let mut usable: Vec<PeerId> = self.usable.iter().copied().collect();
        usable.sort();

        InitiatorView {
            radio: self.radio,
            scanning: self.scanning,
            filter: self.filter.clone(),
            peers: self.peers.clone(),
            usable,
            trees: self
                .sessions
                .iter()
                .map(|(id, s)| (*id, s.services.clone()))
                .collect(),
            descriptions: self
                .sessions
                .iter()
                .filter(|(_, s)| !s.descriptions.is_empty())
                .map(|(id, s)| (*id, s.descriptions.clone()))
                .collect(),
            error: self.errors.latest().cloned(),
            errors_raised: self.errors.raised(),
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Begin (or restart with a new filter) a scan session
    pub fn start_scan(&mut self, filter: ScanFilter) -> Result<(), CoordinatorError> {
        self.ensure_ready()?;
        let result = self.transport.start_scan(&filter);
        self.command(result, CoordinatorError::ScanError)?;

        // Peers with a live link survive a rescan; everything else is forgotten
        self.peers.retain(|p| {
            matches!(
                p.state,
                ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Disconnecting
            )
        });
        let kept: HashSet<PeerId> = self.peers.iter().map(|p| p.id).collect();
        self.sessions.retain(|id, _| kept.contains(id));

        info!(
            "Scan started (services: {:?}, duplicates: {})",
            filter.services, filter.allow_duplicates
        );
        self.filter = Some(filter);
        self.scanning = true;
        Ok(())
    }

    pub fn stop_scan(&mut self) -> Result<(), CoordinatorError> {
        if self.config.always_scanning {
            debug!("stop_scan ignored: always_scanning is set");
            return Ok(());
        }
        let result = self.transport.stop_scan();
        self.command(result, CoordinatorError::ScanError)?;
        self.scanning = false;
        self.filter = None;
        info!("Scan stopped");
        Ok(())
    }

    /// Connect to a discovered peer. A peer already connected or connecting
    /// is left as it is.
    pub fn connect(&mut self, peer: PeerId) -> Result<(), CoordinatorError> {
        self.ensure_ready()?;
        let Some(state) = self.peer(peer).map(|p| p.state) else {
            return Err(self.fail(CoordinatorError::UnknownPeer(peer)));
        };
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!("connect ignored: {} already {:?}", peer, state);
            return Ok(());
        }

        let session = self.session(peer);
        session.reconnect_attempts = 0;
        session.reconnect_pending = false;
        session.cancel_requested = false;
        session.auto_connected = false;
        self.issue_connect(peer)
    }

    /// Tear the link down on purpose; no reconnect follows
    pub fn cancel_connection(&mut self, peer: PeerId) -> Result<(), CoordinatorError> {
        let Some(state) = self.peer(peer).map(|p| p.state) else {
            return Err(self.fail(CoordinatorError::UnknownPeer(peer)));
        };

        let notifying = self.session(peer).notifying();
        for at in notifying {
            let result = self.transport.set_notify(peer, at, false);
            let _ = self.command(result, CoordinatorError::NotifyError);
        }

        // Nothing is marked cancelled until the transport takes the request
        let result = self.transport.cancel_connection(peer);
        self.command(result, CoordinatorError::DisconnectError)?;

        self.usable.remove(&peer);
        let session = self.session(peer);
        session.cancel_requested = true;
        session.reconnect_pending = false;
        session.interrupted = false;
        session.abandoned_attempt = false;

        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            self.set_state(peer, ConnectionState::Disconnecting);
        }
        info!("Cancelling connection to {}", peer);
        Ok(())
    }

    /// Enumerate services; an empty filter asks for all of them
    pub fn discover_services(
        &mut self,
        peer: PeerId,
        filter: &[Uuid],
    ) -> Result<(), CoordinatorError> {
        self.require_connected(peer)?;
        self.request_services(peer, filter)
    }

    pub fn discover_characteristics(
        &mut self,
        peer: PeerId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<(), CoordinatorError> {
        self.require_connected(peer)?;
        let known = self
            .sessions
            .get(&peer)
            .is_some_and(|s| s.services.iter().any(|svc| svc.uuid == service));
        if !known {
            return Err(self.fail(CoordinatorError::UnknownService(service)));
        }
        self.request_characteristics(peer, service, filter)
    }

    pub fn discover_descriptors(
        &mut self,
        peer: PeerId,
        at: CharRef,
    ) -> Result<(), CoordinatorError> {
        self.require_connected(peer)?;
        self.require_characteristic(peer, at)?;
        self.request_descriptors(peer, at)
    }

    /// Toggle notifications. A characteristic that cannot notify raises
    /// `NotifyUnsupported` but the request is still forwarded.
    pub fn set_notification(
        &mut self,
        peer: PeerId,
        at: CharRef,
        enabled: bool,
    ) -> Result<(), CoordinatorError> {
        self.require_connected(peer)?;
        let properties = self.require_characteristic(peer, at)?;
        if !properties.can_notify() {
            self.fail(CoordinatorError::NotifyUnsupported);
        }
        let result = self.transport.set_notify(peer, at, enabled);
        self.command(result, CoordinatorError::NotifyError)
    }

    pub fn read(&mut self, peer: PeerId, at: CharRef) -> Result<(), CoordinatorError> {
        self.require_connected(peer)?;
        self.require_characteristic(peer, at)?;
        let result = self.transport.read(peer, at);
        self.command(result, CoordinatorError::ReadError)
    }

    /// Write `data`. Unacknowledged writes are followed by a bounded poll of
    /// the cached value until it echoes the payload.
    pub fn write(
        &mut self,
        peer: PeerId,
        at: CharRef,
        data: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), CoordinatorError> {
        self.require_connected(peer)?;
        let properties = self.require_characteristic(peer, at)?;
        let supported = match kind {
            WriteKind::WithResponse => properties.has(Property::Write),
            WriteKind::WithoutResponse => properties.has(Property::WriteWithoutResponse),
        };
        if !supported {
            return Err(self.fail(CoordinatorError::WriteTypeMismatch));
        }

        let result = self.transport.write(peer, at, &data, kind);
        self.command(result, CoordinatorError::WriteError)?;
        debug!(
            "Wrote {} bytes ({}) to {} on {} ({:?})",
            data.len(),
            preview(&data),
            at,
            peer,
            kind
        );

        if kind == WriteKind::WithoutResponse {
            self.deferred.push(Deferred::new(
                self.config.write_verify_interval(),
                InitiatorTimer::VerifyWrite {
                    peer,
                    characteristic: at,
                    expected: data,
                    attempt: 1,
                },
            ));
        }
        Ok(())
    }

    /// Adopt scan state the platform resumed on our behalf. Replaces current
    /// state wholesale and issues no transport commands.
    pub fn restore(&mut self, snapshot: RestoredCentral) {
        self.scanning = snapshot.scan_filter.is_some();
        self.filter = snapshot.scan_filter;

        self.peers.clear();
        self.sessions.clear();
        self.usable.clear();
        for peer in snapshot.peers {
            if self.peer(peer.id).is_some() {
                continue;
            }
            if peer.state == ConnectionState::Connected {
                self.usable.insert(peer.id);
            }
            self.sessions.insert(peer.id, PeerSession::default());
            self.peers.push(peer);
        }
        info!(
            "Restored initiator state (scanning: {}, peers: {})",
            self.scanning,
            self.peers.len()
        );
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    pub fn handle_event(&mut self, event: CentralEvent) {
        debug!("Initiator event: {}", event);
        match event {
            CentralEvent::StateChanged(state) => self.on_radio_state(state),
            CentralEvent::PeerDiscovered {
                peer,
                name,
                rssi,
                advertised_services,
            } => self.on_discovered(peer, name, rssi, advertised_services),
            CentralEvent::Connected { peer } => self.on_connected(peer),
            CentralEvent::ConnectFailed { peer, error } => self.on_connect_failed(peer, error),
            CentralEvent::Disconnected { peer, error } => self.on_disconnected(peer, error),
            CentralEvent::ServicesDiscovered { peer, result } => self.on_services(peer, result),
            CentralEvent::CharacteristicsDiscovered {
                peer,
                service,
                result,
            } => self.on_characteristics(peer, service, result),
            CentralEvent::DescriptorsDiscovered {
                peer,
                characteristic,
                result,
            } => self.on_descriptors(peer, characteristic, result),
            CentralEvent::DescriptorValueUpdated {
                peer,
                characteristic,
                descriptor,
                result,
            } => self.on_descriptor_value(peer, characteristic, descriptor, result),
            CentralEvent::ValueUpdated {
                peer,
                characteristic,
                result,
            } => match result {
                Ok(value) => {
                    debug!("Value {} from {} ({} bytes)", characteristic, peer, value.len());
                    if let Some(c) = self
                        .sessions
                        .get_mut(&peer)
                        .and_then(|s| s.characteristic_mut(&characteristic))
                    {
                        c.value = Some(value);
                    }
                }
                Err(reason) => {
                    self.fail(CoordinatorError::ReadError(reason));
                }
            },
            CentralEvent::WriteCompleted {
                peer,
                characteristic,
                result,
            } => match result {
                Ok(()) => debug!("Write to {} on {} acknowledged", characteristic, peer),
                Err(reason) => {
                    self.fail(CoordinatorError::WriteError(reason));
                }
            },
            CentralEvent::NotificationStateChanged {
                peer,
                characteristic,
                result,
            } => match result {
                Ok(enabled) => {
                    if let Some(c) = self
                        .sessions
                        .get_mut(&peer)
                        .and_then(|s| s.characteristic_mut(&characteristic))
                    {
                        c.notifying = enabled;
                    }
                }
                Err(reason) => {
                    self.fail(CoordinatorError::NotifyError(reason));
                }
            },
            CentralEvent::WillRestore(snapshot) => self.restore(snapshot),
        }
    }

    fn on_radio_state(&mut self, state: RadioState) {
        let was_ready = self.radio.is_ready();
        self.radio = state;
        info!("Initiator radio state: {}", state);

        if !state.is_ready() {
            self.scanning = false;
            let live: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|p| {
                    matches!(
                        p.state,
                        ConnectionState::Connecting
                            | ConnectionState::Connected
                            | ConnectionState::Disconnecting
                    )
                })
                .map(|p| p.id)
                .collect();
            for peer in live {
                self.usable.remove(&peer);
                let session = self.session(peer);
                session.clear_notifying();
                session.reconnect_pending = false;
                session.abandoned_attempt = false;
                // An explicit cancel that the radio finished for us stays cancelled
                session.interrupted = !session.cancel_requested;
                session.cancel_requested = false;
                self.set_state(peer, ConnectionState::Disconnected);
                self.set_phase(peer, DiscoveryPhase::Idle);
            }
            return;
        }

        if was_ready {
            return;
        }

        if let Some(filter) = self.filter.clone() {
            match self.transport.start_scan(&filter) {
                Ok(()) => {
                    self.scanning = true;
                    info!("Scan resumed after radio recovery");
                }
                Err(e) => {
                    self.fail(CoordinatorError::from_transport(e, CoordinatorError::ScanError));
                }
            }
        }

        let interrupted: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.interrupted)
            .map(|(id, _)| *id)
            .collect();
        for peer in interrupted {
            let session = self.session(peer);
            session.interrupted = false;
            session.reconnect_attempts = 0;
            let _ = self.issue_connect(peer);
        }
    }

    fn on_discovered(
        &mut self,
        peer: PeerId,
        name: Option<String>,
        rssi: i16,
        advertised_services: Vec<Uuid>,
    ) {
        if let Some(filter) = &self.filter {
            if !filter.matches(&advertised_services) {
                debug!("Ignoring {}: outside scan filter", peer);
                return;
            }
        }

        let advertises_protocol = advertised_services.contains(&self.protocol.service_uuid);
        let (is_new, state) = match self.peers.iter().position(|p| p.id == peer) {
            Some(index) => {
                let existing = &mut self.peers[index];
                if name.is_some() {
                    existing.name = name;
                }
                existing.rssi = Some(rssi);
                existing.advertised_services = advertised_services;
                (false, existing.state)
            }
            None => {
                info!("Discovered peer {} ({:?}, rssi {})", peer, name, rssi);
                let mut fresh = Peer::new(peer);
                fresh.name = name;
                fresh.rssi = Some(rssi);
                fresh.advertised_services = advertised_services;
                self.peers.push(fresh);
                (true, ConnectionState::Discovered)
            }
        };

        let resurfaced = matches!(
            state,
            ConnectionState::Discovered | ConnectionState::Unreachable
        );
        if self.config.auto_connect && advertises_protocol && (is_new || resurfaced) {
            if self.session(peer).reconnect_pending {
                return;
            }
            let session = self.session(peer);
            session.auto_connected = true;
            session.reconnect_attempts = 0;
            session.cancel_requested = false;
            debug!("Auto-connecting to {}", peer);
            let _ = self.issue_connect(peer);
        }
    }

    fn on_connected(&mut self, peer: PeerId) {
        if self.peer(peer).is_none() {
            self.peers.push(Peer::new(peer));
        }

        let session = self.session(peer);
        session.reset_tree();
        session.reconnect_attempts = 0;
        session.reconnect_pending = false;
        session.interrupted = false;
        session.abandoned_attempt = false;
        let filter = if session.auto_connected {
            vec![self.protocol.service_uuid]
        } else {
            Vec::new()
        };

        self.set_state(peer, ConnectionState::Connected);
        self.set_phase(peer, DiscoveryPhase::Idle);
        self.usable.insert(peer);
        info!("Connected to {}", peer);

        let _ = self.request_services(peer, &filter);
    }

    fn on_connect_failed(&mut self, peer: PeerId, error: String) {
        if self.take_abandoned(peer) {
            return;
        }
        match self.peer(peer).map(|p| p.state) {
            Some(ConnectionState::Connecting) => {}
            Some(ConnectionState::Disconnecting) => {
                // The attempt we cancelled ended before it ever connected
                self.session(peer).cancel_requested = false;
                self.set_state(peer, ConnectionState::Disconnected);
                info!("Connection attempt to {} cancelled", peer);
                return;
            }
            _ => {
                debug!("Ignoring stale connect failure for {}", peer);
                return;
            }
        }
        self.set_state(peer, ConnectionState::Disconnected);
        self.fail(CoordinatorError::ConnectError(error));

        let session = self.session(peer);
        if session.cancel_requested {
            session.cancel_requested = false;
            return;
        }
        self.schedule_reconnect(peer);
    }

    fn on_disconnected(&mut self, peer: PeerId, error: Option<String>) {
        let Some(state) = self.peer(peer).map(|p| p.state) else {
            return;
        };
        if self.take_abandoned(peer) {
            return;
        }
        if !matches!(
            state,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnecting
        ) {
            debug!("Ignoring disconnect for {} in state {:?}", peer, state);
            return;
        }

        self.usable.remove(&peer);
        self.set_state(peer, ConnectionState::Disconnected);
        self.set_phase(peer, DiscoveryPhase::Idle);
        let session = self.session(peer);
        session.clear_notifying();

        if session.cancel_requested {
            session.cancel_requested = false;
            info!("Disconnected from {} on request", peer);
            return;
        }

        match error {
            Some(reason) => {
                self.fail(CoordinatorError::DisconnectError(reason));
            }
            None => info!("Link to {} dropped", peer),
        }
        self.schedule_reconnect(peer);
    }

    fn on_services(&mut self, peer: PeerId, result: Result<Vec<DiscoveredService>, String>) {
        if !self.sessions.contains_key(&peer) {
            return;
        }
        self.session(peer).finish();

        match result {
            Err(reason) => {
                self.fail(CoordinatorError::DiscoverServicesError(reason));
            }
            Ok(found) => {
                let session = self.session(peer);
                for discovered in &found {
                    if session.service_mut(&discovered.uuid).is_none() {
                        session
                            .services
                            .push(Service::provisional(discovered.uuid, discovered.primary));
                    }
                }
                let auto = session.auto_connected;
                debug!("{} services on {}", found.len(), peer);

                for discovered in found {
                    let filter = if auto && discovered.uuid == self.protocol.service_uuid {
                        vec![self.protocol.characteristic_uuid]
                    } else {
                        Vec::new()
                    };
                    let _ = self.request_characteristics(peer, discovered.uuid, &filter);
                }
            }
        }
        self.settle(peer);
    }

    fn on_characteristics(
        &mut self,
        peer: PeerId,
        service: Uuid,
        result: Result<Vec<DiscoveredCharacteristic>, String>,
    ) {
        if !self.sessions.contains_key(&peer) {
            return;
        }
        self.session(peer).finish();

        match result {
            Err(reason) => {
                self.fail(CoordinatorError::DiscoverCharacteristicsError(reason));
            }
            Ok(found) => {
                let session = self.session(peer);
                if session.service_mut(&service).is_none() {
                    session.services.push(Service::provisional(service, true));
                }
                if let Some(svc) = session.service_mut(&service) {
                    let previous = svc.characteristics.take().unwrap_or_default();
                    let merged = found
                        .iter()
                        .map(|d| match previous.iter().find(|c| c.uuid == d.uuid) {
                            Some(known) => {
                                let mut kept = known.clone();
                                kept.properties = d.properties.clone();
                                kept
                            }
                            None => Characteristic::new(d.uuid, d.properties.clone()),
                        })
                        .collect();
                    svc.characteristics = Some(merged);
                }

                let target = self.target();
                for discovered in found {
                    let at = CharRef::new(service, discovered.uuid);
                    if self.config.auto_subscribe
                        && at == target
                        && discovered.properties.can_notify()
                    {
                        let result = self.transport.set_notify(peer, at, true);
                        let _ = self.command(result, CoordinatorError::NotifyError);
                    }
                    let _ = self.request_descriptors(peer, at);
                }
            }
        }
        self.settle(peer);
    }

    fn on_descriptors(&mut self, peer: PeerId, at: CharRef, result: Result<Vec<Uuid>, String>) {
        if !self.sessions.contains_key(&peer) {
            return;
        }
        self.session(peer).finish();

        match result {
            Err(reason) => {
                self.fail(CoordinatorError::DiscoverDescriptorError(reason));
            }
            Ok(found) => {
                let Some(c) = self.session(peer).characteristic_mut(&at) else {
                    self.settle(peer);
                    return;
                };
                for uuid in &found {
                    if c.descriptor(uuid).is_none() {
                        c.descriptors.push(Descriptor {
                            uuid: *uuid,
                            value: None,
                        });
                    }
                }
                for uuid in found {
                    let result = self.transport.read_descriptor(peer, at, uuid);
                    if self.command(result, CoordinatorError::UpdateDescriptorError).is_ok() {
                        self.session(peer).begin();
                    }
                }
            }
        }
        self.settle(peer);
    }

    fn on_descriptor_value(
        &mut self,
        peer: PeerId,
        at: CharRef,
        descriptor: Uuid,
        result: Result<DescriptorValue, String>,
    ) {
        if !self.sessions.contains_key(&peer) {
            return;
        }
        self.session(peer).finish();

        match result {
            Err(reason) => {
                self.fail(CoordinatorError::UpdateDescriptorError(reason));
            }
            Ok(value) => {
                let text = value.as_text().map(str::to_string);
                let session = self.session(peer);
                if let Some(c) = session.characteristic_mut(&at) {
                    match c.descriptors.iter_mut().find(|d| d.uuid == descriptor) {
                        Some(d) => d.value = Some(value),
                        None => c.descriptors.push(Descriptor {
                            uuid: descriptor,
                            value: Some(value),
                        }),
                    }
                    if let Some(text) = &text {
                        c.description = Some(text.clone());
                    }
                }
                if let Some(text) = text {
                    session.record_description(&text);
                    if at == self.target() {
                        self.deliver(peer, text);
                    }
                }
            }
        }
        self.settle(peer);
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    pub fn handle_timer(&mut self, timer: InitiatorTimer) {
        match timer {
            InitiatorTimer::Reconnect { peer } => {
                let session = self.session(peer);
                if !session.reconnect_pending {
                    return;
                }
                session.reconnect_pending = false;
                if self.peer(peer).map(|p| p.state) != Some(ConnectionState::Disconnected) {
                    return;
                }
                if !self.radio.is_ready() {
                    self.session(peer).interrupted = true;
                    return;
                }
                let _ = self.issue_connect(peer);
            }
            InitiatorTimer::ConnectTimeout { peer, generation } => {
                let current = self.sessions.get(&peer).map(|s| s.connect_generation);
                let connecting =
                    self.peer(peer).map(|p| p.state) == Some(ConnectionState::Connecting);
                if current != Some(generation) || !connecting {
                    return;
                }
                match self.transport.cancel_connection(peer) {
                    // The platform still owes us a failure report for this attempt
                    Ok(()) => self.session(peer).abandoned_attempt = true,
                    Err(e) => debug!("Cancel after timeout failed for {}: {}", peer, e),
                }
                self.set_state(peer, ConnectionState::Disconnected);
                self.fail(CoordinatorError::ConnectError(
                    "connection attempt timed out".to_string(),
                ));
                self.schedule_reconnect(peer);
            }
            InitiatorTimer::VerifyWrite {
                peer,
                characteristic,
                expected,
                attempt,
            } => self.verify_write(peer, characteristic, expected, attempt),
        }
    }

    fn verify_write(&mut self, peer: PeerId, at: CharRef, expected: Vec<u8>, attempt: u32) {
        let echoed = self
            .characteristic(peer, at)
            .and_then(|c| c.value.as_deref())
            .is_some_and(|v| v == expected.as_slice());
        if echoed {
            debug!("Write to {} confirmed on attempt {}", at, attempt);
            return;
        }
        if attempt >= self.config.write_verify_attempts {
            self.fail(CoordinatorError::WriteUnconfirmed);
            return;
        }

        // Refresh the cached value when the peer lets us read it
        let readable = self
            .characteristic(peer, at)
            .is_some_and(|c| c.properties.has(Property::Read));
        let connected = self.peer(peer).map(|p| p.state) == Some(ConnectionState::Connected);
        if readable && connected {
            if let Err(e) = self.transport.read(peer, at) {
                debug!("Verification read of {} failed: {}", at, e);
            }
        }

        self.deferred.push(Deferred::new(
            self.config.write_verify_interval(),
            InitiatorTimer::VerifyWrite {
                peer,
                characteristic: at,
                expected,
                attempt: attempt + 1,
            },
        ));
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn target(&self) -> CharRef {
        CharRef::new(self.protocol.service_uuid, self.protocol.characteristic_uuid)
    }

    fn session(&mut self, peer: PeerId) -> &mut PeerSession {
        self.sessions.entry(peer).or_default()
    }

    /// Consume the late failure report of an attempt abandoned on timeout
    fn take_abandoned(&mut self, peer: PeerId) -> bool {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return false;
        };
        if !std::mem::take(&mut session.abandoned_attempt) {
            return false;
        }
        debug!("Ignoring report for the timed-out attempt on {}", peer);
        true
    }

    /// Record a fault in the error slot and hand it back for propagation
    fn fail(&mut self, error: CoordinatorError) -> CoordinatorError {
        warn!("Initiator fault: {}", error);
        self.errors.raise(error.clone(), Instant::now());
        error
    }

    fn command(
        &mut self,
        result: Result<(), TransportError>,
        context: fn(String) -> CoordinatorError,
    ) -> Result<(), CoordinatorError> {
        result.map_err(|e| self.fail(CoordinatorError::from_transport(e, context)))
    }

    fn ensure_ready(&mut self) -> Result<(), CoordinatorError> {
        if self.radio.is_ready() {
            Ok(())
        } else {
            Err(self.fail(CoordinatorError::TransportUnavailable))
        }
    }

    fn require_connected(&mut self, peer: PeerId) -> Result<(), CoordinatorError> {
        self.ensure_ready()?;
        match self.peer(peer).map(|p| p.state) {
            None => Err(self.fail(CoordinatorError::UnknownPeer(peer))),
            Some(ConnectionState::Connected) => Ok(()),
            Some(_) => Err(self.fail(CoordinatorError::NotConnected(peer))),
        }
    }

    fn require_characteristic(
        &mut self,
        peer: PeerId,
        at: CharRef,
    ) -> Result<Properties, CoordinatorError> {
        let found = self.characteristic(peer, at).map(|c| c.properties.clone());
        found.ok_or_else(|| self.fail(CoordinatorError::UnknownCharacteristic(at)))
    }

    fn set_state(&mut self, peer: PeerId, state: ConnectionState) {
        if let Some(p) = self.peers.iter_mut().find(|p| p.id == peer) {
            if p.state != state {
                debug!("Peer {}: {:?} -> {:?}", peer, p.state, state);
                p.state = state;
            }
        }
    }

    fn set_phase(&mut self, peer: PeerId, phase: DiscoveryPhase) {
        if let Some(p) = self.peers.iter_mut().find(|p| p.id == peer) {
            p.phase = phase;
        }
    }

    /// Move to `stage` unless discovery is already further along
    fn enter_phase(&mut self, peer: PeerId, stage: DiscoveryPhase) {
        if let Some(p) = self.peers.iter_mut().find(|p| p.id == peer) {
            if p.phase == DiscoveryPhase::Ready || p.phase < stage {
                p.phase = stage;
            }
        }
    }

    /// Mark the tree ready once every outstanding discovery step has answered
    fn settle(&mut self, peer: PeerId) {
        if self.sessions.get(&peer).map(|s| s.pending) != Some(0) {
            return;
        }
        if let Some(p) = self.peers.iter_mut().find(|p| p.id == peer) {
            if p.state == ConnectionState::Connected
                && !matches!(p.phase, DiscoveryPhase::Idle | DiscoveryPhase::Ready)
            {
                p.phase = DiscoveryPhase::Ready;
                info!("Capability tree of {} ready", peer);
            }
        }
    }

    fn issue_connect(&mut self, peer: PeerId) -> Result<(), CoordinatorError> {
        let result = self.transport.connect(peer, true);
        self.command(result, CoordinatorError::ConnectError)?;
        self.set_state(peer, ConnectionState::Connecting);

        let session = self.session(peer);
        session.connect_generation += 1;
        let generation = session.connect_generation;
        if let Some(timeout) = self.config.connect_timeout() {
            self.deferred.push(Deferred::new(
                timeout,
                InitiatorTimer::ConnectTimeout { peer, generation },
            ));
        }
        debug!("Connect requested for {}", peer);
        Ok(())
    }

    /// Spend one attempt of the reconnect budget, or give the peer up
    fn schedule_reconnect(&mut self, peer: PeerId) {
        if !self.radio.is_ready() {
            self.session(peer).interrupted = true;
            return;
        }

        let policy = self.config.reconnect.clone();
        let attempt = self.session(peer).reconnect_attempts;
        if !policy.should_retry(attempt) {
            self.set_state(peer, ConnectionState::Unreachable);
            self.fail(CoordinatorError::Unreachable(peer));
            return;
        }

        self.session(peer).reconnect_attempts = attempt + 1;
        let delay = policy.delay_for(attempt);
        if delay.is_zero() {
            info!("Reconnecting to {}", peer);
            let _ = self.issue_connect(peer);
        } else {
            info!("Reconnecting to {} in {:?} (attempt {})", peer, delay, attempt + 1);
            self.session(peer).reconnect_pending = true;
            self.deferred
                .push(Deferred::new(delay, InitiatorTimer::Reconnect { peer }));
        }
    }

    fn request_services(&mut self, peer: PeerId, filter: &[Uuid]) -> Result<(), CoordinatorError> {
        let result = self.transport.discover_services(peer, filter);
        self.command(result, CoordinatorError::DiscoverServicesError)?;
        self.session(peer).begin();
        self.enter_phase(peer, DiscoveryPhase::Services);
        Ok(())
    }

    fn request_characteristics(
        &mut self,
        peer: PeerId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<(), CoordinatorError> {
        let result = self.transport.discover_characteristics(peer, service, filter);
        self.command(result, CoordinatorError::DiscoverCharacteristicsError)?;
        self.session(peer).begin();
        self.enter_phase(peer, DiscoveryPhase::Characteristics);
        Ok(())
    }

    fn request_descriptors(&mut self, peer: PeerId, at: CharRef) -> Result<(), CoordinatorError> {
        let result = self.transport.discover_descriptors(peer, at);
        self.command(result, CoordinatorError::DiscoverDescriptorError)?;
        self.session(peer).begin();
        self.enter_phase(peer, DiscoveryPhase::Descriptors);
        Ok(())
    }

    /// Hand a remote textual request to the notification collaborator unless
    /// the same text was seen within the dedupe window
    fn deliver(&mut self, peer: PeerId, text: String) {
        if !self.dedupe.admit(&text, Instant::now()) {
            debug!("Suppressed duplicate request from {}", peer);
            return;
        }
        info!("Remote request from {}: {:?}", peer, text);
        if let Some(sink) = &self.requests {
            if sink.send(RemoteRequest { peer, text }).is_err() {
                debug!("Request sink closed; dropping request");
            }
        }
    }
}
