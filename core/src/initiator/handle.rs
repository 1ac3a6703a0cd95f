//! Runtime loop and command handle for the initiator
//!
//! One tokio task owns the coordinator. It multiplexes handle commands,
//! transport events and its own timers, then republishes the observable view.

use super::{InitiatorCoordinator, InitiatorTimer, InitiatorView};
use crate::error::CoordinatorError;
use crate::gatt::{CharRef, PeerId, ScanFilter};
use crate::restore::RestoredCentral;
use crate::schedule;
use crate::transport::{CentralEvent, WriteKind};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

type Reply = oneshot::Sender<Result<(), CoordinatorError>>;

/// Commands accepted by the initiator loop
#[derive(Debug)]
pub enum InitiatorCommand {
    StartScan {
        filter: ScanFilter,
        reply: Reply,
    },
    StopScan {
        reply: Reply,
    },
    Connect {
        peer: PeerId,
        reply: Reply,
    },
    CancelConnection {
        peer: PeerId,
        reply: Reply,
    },
    DiscoverServices {
        peer: PeerId,
        filter: Vec<Uuid>,
        reply: Reply,
    },
    DiscoverCharacteristics {
        peer: PeerId,
        service: Uuid,
        filter: Vec<Uuid>,
        reply: Reply,
    },
    DiscoverDescriptors {
        peer: PeerId,
        characteristic: CharRef,
        reply: Reply,
    },
    SetNotification {
        peer: PeerId,
        characteristic: CharRef,
        enabled: bool,
        reply: Reply,
    },
    Read {
        peer: PeerId,
        characteristic: CharRef,
        reply: Reply,
    },
    Write {
        peer: PeerId,
        characteristic: CharRef,
        data: Vec<u8>,
        kind: WriteKind,
        reply: Reply,
    },
    Restore {
        snapshot: RestoredCentral,
        reply: Reply,
    },
    Shutdown,
}

/// Cloneable handle to a running initiator
#[derive(Clone)]
pub struct InitiatorHandle {
    command_tx: mpsc::Sender<InitiatorCommand>,
    view: Arc<RwLock<InitiatorView>>,
}

impl InitiatorHandle {
    /// Latest published state
    pub fn view(&self) -> InitiatorView {
        self.view.read().clone()
    }

    pub async fn start_scan(&self, filter: ScanFilter) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::StartScan { filter, reply })
            .await
    }

    pub async fn stop_scan(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::StopScan { reply }).await
    }

    pub async fn connect(&self, peer: PeerId) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::Connect { peer, reply })
            .await
    }

    pub async fn cancel_connection(&self, peer: PeerId) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::CancelConnection { peer, reply })
            .await
    }

    pub async fn discover_services(
        &self,
        peer: PeerId,
        filter: Vec<Uuid>,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::DiscoverServices {
            peer,
            filter,
            reply,
        })
        .await
    }

    pub async fn discover_characteristics(
        &self,
        peer: PeerId,
        service: Uuid,
        filter: Vec<Uuid>,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::DiscoverCharacteristics {
            peer,
            service,
            filter,
            reply,
        })
        .await
    }

    pub async fn discover_descriptors(
        &self,
        peer: PeerId,
        characteristic: CharRef,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::DiscoverDescriptors {
            peer,
            characteristic,
            reply,
        })
        .await
    }

    pub async fn set_notification(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        enabled: bool,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::SetNotification {
            peer,
            characteristic,
            enabled,
            reply,
        })
        .await
    }

    pub async fn read(
        &self,
        peer: PeerId,
        characteristic: CharRef,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::Read {
            peer,
            characteristic,
            reply,
        })
        .await
    }

    pub async fn write(
        &self,
        peer: PeerId,
        characteristic: CharRef,
        data: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::Write {
            peer,
            characteristic,
            data,
            kind,
            reply,
        })
        .await
    }

    pub async fn restore(&self, snapshot: RestoredCentral) -> Result<(), CoordinatorError> {
        self.request(|reply| InitiatorCommand::Restore { snapshot, reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.command_tx
            .send(InitiatorCommand::Shutdown)
            .await
            .map_err(|_| CoordinatorError::InvalidCoordinator)
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> InitiatorCommand,
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
pub fn spawn_initiator(
    coordinator: InitiatorCoordinator,
    events: mpsc::UnboundedReceiver<CentralEvent>,
) -> (InitiatorHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel::<InitiatorCommand>(256);
    let view = Arc::new(RwLock::new(coordinator.view()));
    let handle = InitiatorHandle {
        command_tx,
        view: view.clone(),
    };

    let task = tokio::spawn(run(coordinator, command_rx, events, view));
    (handle, task)
}

async fn run(
    mut coordinator: InitiatorCoordinator,
    mut commands: mpsc::Receiver<InitiatorCommand>,
    mut events: mpsc::UnboundedReceiver<CentralEvent>,
    view: Arc<RwLock<InitiatorView>>,
) {
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<InitiatorTimer>();
    let mut events_open = true;
    info!("Initiator loop started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(InitiatorCommand::Shutdown) | None => break,
                Some(command) => dispatch(&mut coordinator, command),
            },
            event = events.recv(), if events_open => match event {
                Some(event) => coordinator.handle_event(event),
                None => {
                    debug!("Initiator transport event channel closed");
                    events_open = false;
                }
            },
            Some(timer) = timer_rx.recv() => coordinator.handle_timer(timer),
        }

        for deferred in coordinator.take_deferred() {
            schedule::arm(deferred, timer_tx.clone());
        }
        *view.write() = coordinator.view();
    }

    info!("Initiator loop stopped");
}

fn dispatch(coordinator: &mut InitiatorCoordinator, command: InitiatorCommand) {
    // A dropped reply receiver means the caller stopped waiting
    match command {
        InitiatorCommand::StartScan { filter, reply } => {
            let _ = reply.send(coordinator.start_scan(filter));
        }
        InitiatorCommand::StopScan { reply } => {
            let _ = reply.send(coordinator.stop_scan());
        }
        InitiatorCommand::Connect { peer, reply } => {
            let _ = reply.send(coordinator.connect(peer));
        }
        InitiatorCommand::CancelConnection { peer, reply } => {
            let _ = reply.send(coordinator.cancel_connection(peer));
        }
        InitiatorCommand::DiscoverServices {
            peer,
            filter,
            reply,
        } => {
            let _ = reply.send(coordinator.discover_services(peer, &filter));
        }
        InitiatorCommand::DiscoverCharacteristics {
            peer,
            service,
            filter,
            reply,
        } => {
            let _ = reply.send(coordinator.discover_characteristics(peer, service, &filter));
        }
        InitiatorCommand::DiscoverDescriptors {
            peer,
            characteristic,
            reply,
        } => {
            let _ = reply.send(coordinator.discover_descriptors(peer, characteristic));
        }
        InitiatorCommand::SetNotification {
            peer,
            characteristic,
            enabled,
            reply,
        } => {
            let _ = reply.send(coordinator.set_notification(peer, characteristic, enabled));
        }
        InitiatorCommand::Read {
            peer,
            characteristic,
            reply,
        } => {
            let _ = reply.send(coordinator.read(peer, characteristic));
        }
        InitiatorCommand::Write {
            peer,
            characteristic,
            data,
            kind,
            reply,
        } => {
            let _ = reply.send(coordinator.write(peer, characteristic, data, kind));
        }
        InitiatorCommand::Restore { snapshot, reply } => {
            coordinator.restore(snapshot);
            let _ = reply.send(Ok(()));
        }
        InitiatorCommand::Shutdown => {}
    }
}
