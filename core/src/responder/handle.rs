//! Runtime loop and command handle for the responder

use super::{ResponderCoordinator, ResponderView};
use crate::error::CoordinatorError;
use crate::gatt::{CentralId, CharRef, Service};
use crate::restore::RestoredPeripheral;
use crate::transport::PeripheralEvent;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

type Reply = oneshot::Sender<Result<(), CoordinatorError>>;

#[derive(Debug)]
pub enum ResponderCommand {
    AddService {
        service: Service,
        reply: Reply,
    },
    RemoveService {
        service: Uuid,
        reply: Reply,
    },
    StartAdvertising {
        reply: Reply,
    },
    StopAdvertising {
        reply: Reply,
    },
    UpdateValue {
        characteristic: CharRef,
        data: Vec<u8>,
        subscribers: Vec<CentralId>,
        reply: Reply,
    },
    Restore {
        snapshot: RestoredPeripheral,
        reply: Reply,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct ResponderHandle {
    command_tx: mpsc::Sender<ResponderCommand>,
    view: Arc<RwLock<ResponderView>>,
}

impl ResponderHandle {
    pub fn view(&self) -> ResponderView {
        self.view.read().clone()
    }

    pub async fn add_service(&self, service: Service) -> Result<(), CoordinatorError> {
        self.request(|reply| ResponderCommand::AddService { service, reply })
            .await
    }

    pub async fn remove_service(&self, service: Uuid) -> Result<(), CoordinatorError> {
        self.request(|reply| ResponderCommand::RemoveService { service, reply })
            .await
    }

    pub async fn start_advertising(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| ResponderCommand::StartAdvertising { reply })
            .await
    }

    pub async fn stop_advertising(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| ResponderCommand::StopAdvertising { reply })
            .await
    }

    /// Push to `subscribers`, or to everyone subscribed when empty
    pub async fn update_value(
        &self,
        characteristic: CharRef,
        data: Vec<u8>,
        subscribers: Vec<CentralId>,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| ResponderCommand::UpdateValue {
            characteristic,
            data,
            subscribers,
            reply,
        })
        .await
    }

    pub async fn restore(&self, snapshot: RestoredPeripheral) -> Result<(), CoordinatorError> {
        self.request(|reply| ResponderCommand::Restore { snapshot, reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.command_tx
            .send(ResponderCommand::Shutdown)
            .await
            .map_err(|_| CoordinatorError::InvalidCoordinator)
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> ResponderCommand,
    ) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| CoordinatorError::InvalidCoordinator)?;
        rx.await.map_err(|_| CoordinatorError::InvalidCoordinator)?
    }
}

/// Move `coordinator` onto its own task, fed by `events` from the transport
pub fn spawn_responder(
    coordinator: ResponderCoordinator,
    events: mpsc::UnboundedReceiver<PeripheralEvent>,
) -> (ResponderHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel::<ResponderCommand>(256);
    let view = Arc::new(RwLock::new(coordinator.view()));
    let handle = ResponderHandle {
        command_tx,
        view: view.clone(),
    };

    let task = tokio::spawn(run(coordinator, command_rx, events, view));
    (handle, task)
}

async fn run(
    mut coordinator: ResponderCoordinator,
    mut commands: mpsc::Receiver<ResponderCommand>,
    mut events: mpsc::UnboundedReceiver<PeripheralEvent>,
    view: Arc<RwLock<ResponderView>>,
) {
    let mut events_open = true;
    info!("Responder loop started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ResponderCommand::Shutdown) | None => break,
                Some(command) => dispatch(&mut coordinator, command),
            },
            event = events.recv(), if events_open => match event {
                Some(event) => coordinator.handle_event(event),
                None => {
                    debug!("Responder transport event channel closed");
                    events_open = false;
                }
            },
        }
        *view.write() = coordinator.view();
    }

    info!("Responder loop stopped");
}

fn dispatch(coordinator: &mut ResponderCoordinator, command: ResponderCommand) {
    match command {
        ResponderCommand::AddService { service, reply } => {
            let _ = reply.send(coordinator.add_service(service));
        }
        ResponderCommand::RemoveService { service, reply } => {
            let _ = reply.send(coordinator.remove_service(service));
        }
        ResponderCommand::StartAdvertising { reply } => {
            let _ = reply.send(coordinator.start_advertising());
        }
        ResponderCommand::StopAdvertising { reply } => {
            coordinator.stop_advertising();
            let _ = reply.send(Ok(()));
        }
        ResponderCommand::UpdateValue {
            characteristic,
            data,
            subscribers,
            reply,
        } => {
            let _ = reply.send(coordinator.update_value(characteristic, data, &subscribers));
        }
        ResponderCommand::Restore { snapshot, reply } => {
            coordinator.restore(snapshot);
            let _ = reply.send(Ok(()));
        }
        ResponderCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponderConfig;
    use crate::gatt::{
        Characteristic, Permission, Property, TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID,
    };
    use crate::transport::{MockPeripheralTransport, RadioState};

    #[tokio::test]
    async fn test_handle_publishes_subscriptions() {
        let mut mock = MockPeripheralTransport::new();
        mock.expect_radio_state().return_const(RadioState::PoweredOn);
        mock.expect_add_service().returning(|_| Ok(()));
        mock.expect_start_advertising().returning(|_| Ok(()));
        mock.expect_update_value().returning(|_, _, _| Ok(true));
        let coordinator = ResponderCoordinator::new(ResponderConfig::default(), Arc::new(mock));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_responder(coordinator, events_rx);
        let target = CharRef::new(TARGET_SERVICE_UUID, TARGET_CHARACTERISTIC_UUID);

        handle
            .add_service(Service::new(
                TARGET_SERVICE_UUID,
                true,
                vec![Characteristic::new(TARGET_CHARACTERISTIC_UUID, [Property::Notify])
                    .with_permissions([Permission::Readable])],
            ))
            .await
            .expect("add");
        handle.start_advertising().await.expect("advertise");
        assert!(handle.view().advertising);

        events_tx
            .send(PeripheralEvent::Subscribed {
                central: CentralId::random(),
                characteristic: target,
                max_update_len: 20,
            })
            .expect("event");
        // Let the loop take the event before the next command
        tokio::task::yield_now().await;
        assert_eq!(
            handle.update_value(target, vec![1; 21], vec![]).await,
            Err(CoordinatorError::PayloadTooLarge { len: 21, max: 20 })
        );
        assert_eq!(handle.view().subscriber_count(target), 1);

        handle.shutdown().await.expect("shutdown");
        task.await.expect("loop exits");
    }
}
