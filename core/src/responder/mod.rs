//! Responder coordinator
//!
//! Publishes local services after checking them against the legality rules,
//! advertises them, tracks who is subscribed to what and answers inbound
//! read/write requests.

pub mod handle;
mod legality;
mod subscribers;

pub use handle::{spawn_responder, ResponderCommand, ResponderHandle};
pub use legality::validate_service;
pub use subscribers::SubscriberSets;

use crate::config::ResponderConfig;
use crate::error::{CoordinatorError, ErrorSlot, TransientError};
use crate::gatt::{CentralId, CharRef, Characteristic, Service};
use crate::preview;
use crate::restore::RestoredPeripheral;
use crate::transport::{
    AdvertisementData, AttResponse, PeripheralEvent, PeripheralTransport, RadioState, RequestId,
    TransportError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observable responder state
#[derive(Debug, Clone)]
pub struct ResponderView {
    pub radio: RadioState,
    pub advertising: bool,
    pub published: Vec<Service>,
    pub subscriber_counts: HashMap<CharRef, usize>,
    /// Bumped on every subscribe/unsubscribe
    pub subscription_generation: u64,
    /// Latest pushed or written value per characteristic
    pub values: HashMap<CharRef, Vec<u8>>,
    pub error: Option<TransientError>,
    pub errors_raised: u64,
}

impl ResponderView {
    pub fn subscriber_count(&self, at: CharRef) -> usize {
        self.subscriber_counts.get(&at).copied().unwrap_or(0)
    }

    pub fn active_error(&self, now: Instant) -> Option<&TransientError> {
        self.error.as_ref().filter(|e| e.is_active(now))
    }
}

/// A push held back by a full outbound queue
#[derive(Debug, Clone)]
struct PendingUpdate {
    data: Vec<u8>,
    subscribers: Vec<CentralId>,
}

pub struct ResponderCoordinator {
    config: ResponderConfig,
    transport: Arc<dyn PeripheralTransport>,
    radio: RadioState,
    published: Vec<Service>,
    advertising: bool,
    /// Advertising was cut by the radio and should come back with it
    resume_advertising: bool,
    subscribers: SubscriberSets,
    history: HashMap<CharRef, VecDeque<Vec<u8>>>,
    values: HashMap<CharRef, Vec<u8>>,
    pending: HashMap<CharRef, PendingUpdate>,
    errors: ErrorSlot,
}

impl ResponderCoordinator {
    pub fn new(config: ResponderConfig, transport: Arc<dyn PeripheralTransport>) -> Self {
        let radio = transport.radio_state();
        Self {
            errors: ErrorSlot::new(config.transient_error_ttl()),
            config,
            transport,
            radio,
            published: Vec::new(),
            advertising: false,
            resume_advertising: false,
            subscribers: SubscriberSets::new(),
            history: HashMap::new(),
            values: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn published(&self) -> &[Service] {
        &self.published
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn subscribers(&self) -> &SubscriberSets {
        &self.subscribers
    }

    /// Pushed values for `at`, most recent first
    pub fn history(&self, at: CharRef) -> Vec<Vec<u8>> {
        self.history
            .get(&at)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn errors(&self) -> &ErrorSlot {
        &self.errors
    }

    pub fn view(&self) -> ResponderView {
        ResponderView {
            radio: self.radio,
            advertising: self.advertising,
            published: self.published.clone(),
            subscriber_counts: self.subscribers.counts(),
            subscription_generation: self.subscribers.generation(),
            values: self.values.clone(),
            error: self.errors.latest().cloned(),
            errors_raised: self.errors.raised(),
        }
    }

    pub fn add_service(&mut self, service: Service) -> Result<(), CoordinatorError> {
        if let Err(e) = validate_service(&service, &self.published) {
            return Err(self.fail(e));
        }
        let result = self.transport.add_service(&service);
        self.command(result, CoordinatorError::AddServiceError)?;

        info!(
            "Publishing service {} ({} characteristics)",
            service.uuid,
            service.characteristics().len()
        );
        // Optimistic; a failed ServiceAdded rolls this back
        self.published.push(service);
        Ok(())
    }

    pub fn remove_service(&mut self, uuid: Uuid) -> Result<(), CoordinatorError> {
        if !self.published.iter().any(|s| s.uuid == uuid) {
            return Err(self.fail(CoordinatorError::ServiceNotFound(uuid)));
        }
        if self
            .published
            .iter()
            .any(|s| s.uuid != uuid && s.included.contains(&uuid))
        {
            return Err(self.fail(CoordinatorError::ServiceInUse(uuid)));
        }

        self.forget_service(uuid);
        info!("Removed service {}", uuid);
        let result = self.transport.remove_service(uuid);
        self.command(result, CoordinatorError::RemoveServiceError)
    }

    pub fn start_advertising(&mut self) -> Result<(), CoordinatorError> {
        if self.published.is_empty() {
            return Err(self.fail(CoordinatorError::NoServicesToAdvertise));
        }
        if !self.radio.is_ready() {
            if let Err(e) = self.transport.stop_advertising() {
                debug!("stop_advertising while radio down: {}", e);
            }
            self.advertising = false;
            return Err(self.fail(CoordinatorError::TransportUnavailable));
        }

        let data = AdvertisementData::Services {
            local_name: self.config.local_name.clone(),
            service_uuids: self.published.iter().map(|s| s.uuid).collect(),
        };
        let result = self.transport.start_advertising(&data);
        self.command(result, CoordinatorError::AdvertiseError)?;
        self.advertising = true;
        self.resume_advertising = false;
        info!("Advertising {} services", self.published.len());
        Ok(())
    }

    pub fn stop_advertising(&mut self) {
        let result = self.transport.stop_advertising();
        let _ = self.command(result, CoordinatorError::AdvertiseError);
        self.advertising = false;
        self.resume_advertising = false;
        info!("Advertising stopped");
    }

    /// Push `data` to the subscribers of `at` (all of them when `targets` is
    /// empty). A full outbound queue yields `UpdateFailed`; the payload is
    /// kept and re-pushed once the transport reports room again.
    pub fn update_value(
        &mut self,
        at: CharRef,
        data: Vec<u8>,
        targets: &[CentralId],
    ) -> Result<(), CoordinatorError> {
        let Some(c) = self.local_characteristic(at) else {
            return Err(self.fail(CoordinatorError::UnknownCharacteristic(at)));
        };
        if c.value.is_some() {
            return Err(self.fail(CoordinatorError::CharacteristicNotMutable(at.characteristic)));
        }

        let max = self
            .subscribers
            .max_update_len(at, targets)
            .unwrap_or(self.config.default_max_update_len);
        if data.len() > max {
            return Err(self.fail(CoordinatorError::PayloadTooLarge {
                len: data.len(),
                max,
            }));
        }

        match self.transport.update_value(at, &data, targets) {
            Ok(true) => {
                debug!("Pushed {} bytes ({}) on {}", data.len(), preview(&data), at);
                self.record_push(at, data);
                Ok(())
            }
            Ok(false) => {
                self.pending.insert(
                    at,
                    PendingUpdate {
                        data,
                        subscribers: targets.to_vec(),
                    },
                );
                Err(self.fail(CoordinatorError::UpdateFailed))
            }
            Err(e) => Err(self.fail(Self::lift_update_error(e, at))),
        }
    }

    /// Adopt services and subscribers the platform kept alive. Replaces
    /// current state and issues no transport commands.
    pub fn restore(&mut self, snapshot: RestoredPeripheral) {
        self.published.clear();
        for service in snapshot.services {
            if !self.published.iter().any(|s| s.uuid == service.uuid) {
                self.published.push(service);
            }
        }

        self.subscribers.clear();
        for sub in snapshot.subscriptions {
            self.subscribers
                .subscribe(sub.characteristic, sub.central, sub.max_update_len);
        }
        self.history.clear();
        self.values.clear();
        self.pending.clear();
        self.advertising = snapshot.advertising;
        self.resume_advertising = false;
        info!(
            "Restored responder state (services: {}, advertising: {})",
            self.published.len(),
            self.advertising
        );
    }

    pub fn handle_event(&mut self, event: PeripheralEvent) {
        debug!("Responder event: {}", event);
        match event {
            PeripheralEvent::StateChanged(state) => self.on_radio_state(state),
            PeripheralEvent::ServiceAdded { service, error } => match error {
                None => debug!("Service {} registered", service),
                Some(reason) => {
                    if self.published.iter().any(|s| s.uuid == service) {
                        self.forget_service(service);
                    }
                    self.fail(CoordinatorError::AddServiceError(reason));
                }
            },
            PeripheralEvent::AdvertisingStarted { error } => match error {
                None => debug!("Advertising confirmed"),
                Some(reason) => {
                    self.advertising = false;
                    self.fail(CoordinatorError::AdvertiseError(reason));
                }
            },
            PeripheralEvent::Subscribed {
                central,
                characteristic,
                max_update_len,
            } => {
                if self
                    .subscribers
                    .subscribe(characteristic, central, max_update_len)
                {
                    info!(
                        "{} subscribed to {} (max update {} bytes)",
                        central, characteristic, max_update_len
                    );
                }
            }
            PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            } => {
                if self.subscribers.unsubscribe(characteristic, central) {
                    info!("{} unsubscribed from {}", central, characteristic);
                }
            }
            PeripheralEvent::ReadRequest {
                request,
                central,
                characteristic,
                offset,
            } => {
                let response = self.serve_read(characteristic, offset);
                debug!("Read of {} by {}: {:?}", characteristic, central, response);
                self.respond(request, response, CoordinatorError::ReadError);
            }
            PeripheralEvent::WriteRequest {
                request,
                central,
                characteristic,
                value,
                response_required,
            } => {
                let response = self.serve_write(characteristic, central, value);
                if response_required {
                    self.respond(request, response, CoordinatorError::WriteError);
                }
            }
            PeripheralEvent::ReadyToUpdateSubscribers => self.flush_pending(),
            PeripheralEvent::WillRestore(snapshot) => self.restore(snapshot),
        }
    }

    fn on_radio_state(&mut self, state: RadioState) {
        let was_ready = self.radio.is_ready();
        self.radio = state;
        info!("Responder radio state: {}", state);

        if !state.is_ready() {
            if self.advertising {
                self.advertising = false;
                self.resume_advertising = true;
            }
            return;
        }
        if !was_ready && self.resume_advertising {
            let _ = self.start_advertising();
        }
    }

    fn serve_read(&self, at: CharRef, offset: usize) -> AttResponse {
        let Some(c) = self.local_characteristic(at) else {
            return AttResponse::AttributeNotFound;
        };
        if !c.permissions.readable() {
            return AttResponse::ReadNotPermitted;
        }

        let value = self
            .values
            .get(&at)
            .or(c.value.as_ref())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        match value.get(offset..) {
            Some(rest) => AttResponse::Success(rest.to_vec()),
            None => AttResponse::InvalidOffset,
        }
    }

    fn serve_write(&mut self, at: CharRef, central: CentralId, value: Vec<u8>) -> AttResponse {
        let Some(c) = self.local_characteristic(at) else {
            return AttResponse::AttributeNotFound;
        };
        if !c.permissions.writeable() {
            return AttResponse::WriteNotPermitted;
        }
        info!(
            "{} wrote {} bytes ({}) to {}",
            central,
            value.len(),
            preview(&value),
            at
        );
        self.values.insert(at, value);
        AttResponse::Success(Vec::new())
    }

    fn respond(
        &mut self,
        request: RequestId,
        response: AttResponse,
        context: fn(String) -> CoordinatorError,
    ) {
        let result = self.transport.respond(request, response);
        let _ = self.command(result, context);
    }

    fn flush_pending(&mut self) {
        let mut queued: Vec<(CharRef, PendingUpdate)> = self.pending.drain().collect();
        while let Some((at, update)) = queued.pop() {
            match self
                .transport
                .update_value(at, &update.data, &update.subscribers)
            {
                Ok(true) => {
                    debug!("Re-pushed pending update on {}", at);
                    self.record_push(at, update.data);
                }
                Ok(false) => {
                    // Still full; keep the rest for the next ready signal
                    self.pending.insert(at, update);
                    self.pending.extend(queued);
                    return;
                }
                Err(e) => {
                    self.fail(Self::lift_update_error(e, at));
                }
            }
        }
    }

    fn record_push(&mut self, at: CharRef, data: Vec<u8>) {
        let history = self.history.entry(at).or_default();
        history.push_front(data.clone());
        history.truncate(self.config.value_history_limit);
        self.values.insert(at, data);
    }

    fn forget_service(&mut self, uuid: Uuid) {
        self.published.retain(|s| s.uuid != uuid);
        self.subscribers.clear_service(uuid);
        self.history.retain(|at, _| at.service != uuid);
        self.values.retain(|at, _| at.service != uuid);
        self.pending.retain(|at, _| at.service != uuid);
    }

    fn local_characteristic(&self, at: CharRef) -> Option<&Characteristic> {
        self.published
            .iter()
            .find(|s| s.uuid == at.service)
            .and_then(|s| s.characteristic(&at.characteristic))
    }

    fn lift_update_error(err: TransportError, at: CharRef) -> CoordinatorError {
        match err {
            TransportError::Unavailable => CoordinatorError::TransportUnavailable,
            TransportError::InvalidHandle => CoordinatorError::InvalidCoordinator,
            TransportError::Rejected(_) => {
                CoordinatorError::CharacteristicNotMutable(at.characteristic)
            }
        }
    }

    fn fail(&mut self, error: CoordinatorError) -> CoordinatorError {
        warn!("Responder fault: {}", error);
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
}
