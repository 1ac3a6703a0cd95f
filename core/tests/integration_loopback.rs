//! End-to-end exchange between both coordinators over the loopback radio

use nearlink_core::transport::{LoopbackRadio, RadioState, WriteKind};
use nearlink_core::{
    spawn_initiator, spawn_responder, CharRef, Characteristic, ConnectionState, CoordinatorError,
    Descriptor, DiscoveryPhase, InitiatorCoordinator, InitiatorHandle, NearlinkConfig, PeerId,
    Permission, Property, RemoteRequest, ResponderCoordinator, ResponderHandle, ScanFilter,
    Service, TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Pair {
    radio: LoopbackRadio,
    initiator: InitiatorHandle,
    responder: ResponderHandle,
    requests: mpsc::UnboundedReceiver<RemoteRequest>,
}

fn target() -> CharRef {
    CharRef::new(TARGET_SERVICE_UUID, TARGET_CHARACTERISTIC_UUID)
}

fn help_service(text: &str) -> Service {
    Service::new(
        TARGET_SERVICE_UUID,
        true,
        vec![Characteristic::new(
            TARGET_CHARACTERISTIC_UUID,
            [Property::Read, Property::Write, Property::Notify],
        )
        .with_permissions([Permission::Readable, Permission::Writeable])
        .with_descriptor(Descriptor::user_description(text))],
    )
}

fn pair(config: NearlinkConfig) -> Pair {
    let (radio, central_rx, peripheral_rx) = LoopbackRadio::new();
    let (request_tx, requests) = mpsc::unbounded_channel();

    let initiator = InitiatorCoordinator::new(
        config.initiator.clone(),
        config.protocol,
        Arc::new(radio.clone()),
    )
    .with_request_sink(request_tx);
    let responder = ResponderCoordinator::new(config.responder.clone(), Arc::new(radio.clone()));

    let (initiator, _) = spawn_initiator(initiator, central_rx);
    let (responder, _) = spawn_responder(responder, peripheral_rx);
    Pair {
        radio,
        initiator,
        responder,
        requests,
    }
}

/// Poll until `check` holds or the wait budget runs out
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Publish, advertise, scan and wait for the first request to arrive
async fn establish(pair: &mut Pair, text: &str) -> PeerId {
    pair.responder
        .add_service(help_service(text))
        .await
        .expect("add service");
    pair.responder
        .start_advertising()
        .await
        .expect("start advertising");
    pair.initiator
        .start_scan(ScanFilter::for_service(TARGET_SERVICE_UUID))
        .await
        .expect("start scan");

    let request = timeout(WAIT, pair.requests.recv())
        .await
        .expect("request in time")
        .expect("request channel open");
    assert_eq!(request.text, text);
    assert_eq!(request.peer, pair.radio.peer_id());

    let peer = request.peer;
    let initiator = pair.initiator.clone();
    let responder = pair.responder.clone();
    eventually("discovery to finish", || {
        let view = initiator.view();
        view.peer(peer).map(|p| p.phase) == Some(DiscoveryPhase::Ready)
            && responder.view().subscriber_count(target()) == 1
    })
    .await;
    peer
}

#[tokio::test]
async fn test_request_travels_to_initiator() {
    let mut pair = pair(NearlinkConfig::default());
    let peer = establish(&mut pair, "Need jumper cables on 5th Ave").await;

    let view = pair.initiator.view();
    let found = view.peer(peer).expect("peer tracked");
    assert_eq!(found.state, ConnectionState::Connected);
    assert_eq!(found.name.as_deref(), Some("nearlink"));
    assert_eq!(view.usable, vec![peer]);
    assert_eq!(
        view.descriptions.get(&peer).cloned(),
        Some(vec!["Need jumper cables on 5th Ave".to_string()])
    );

    let tree = view.trees.get(&peer).expect("service tree");
    let c = tree[0]
        .characteristic(&TARGET_CHARACTERISTIC_UUID)
        .expect("target characteristic");
    assert!(c.notifying);
}

#[tokio::test]
async fn test_push_reaches_initiator_cache() {
    let mut pair = pair(NearlinkConfig::default());
    let peer = establish(&mut pair, "Flat tyre").await;

    pair.responder
        .update_value(target(), b"on my way".to_vec(), vec![])
        .await
        .expect("push");

    let initiator = pair.initiator.clone();
    eventually("pushed value to arrive", || {
        initiator.view().trees.get(&peer).is_some_and(|tree| {
            tree.iter()
                .flat_map(|s| s.characteristics())
                .any(|c| c.value.as_deref() == Some(b"on my way".as_slice()))
        })
    })
    .await;
}

#[tokio::test]
async fn test_link_drop_reconnects_without_repeating_request() {
    let mut pair = pair(NearlinkConfig::default());
    let peer = establish(&mut pair, "Lost dog, brown lab").await;
    let generation = pair.responder.view().subscription_generation;

    pair.radio.drop_link(Some("supervision timeout".into()));

    let initiator = pair.initiator.clone();
    let responder = pair.responder.clone();
    eventually("reconnect and rediscovery", || {
        let resubscribed = responder.view().subscription_generation >= generation + 2;
        resubscribed
            && initiator.view().peer(peer).map(|p| p.phase) == Some(DiscoveryPhase::Ready)
    })
    .await;

    assert!(pair.radio.is_connected());
    assert!(pair.requests.try_recv().is_err(), "duplicate request delivered");
    assert!(pair.initiator.view().errors_raised >= 1);
}

#[tokio::test]
async fn test_cancelled_link_stays_down() {
    let mut pair = pair(NearlinkConfig::default());
    let peer = establish(&mut pair, "Battery dead").await;

    pair.initiator
        .cancel_connection(peer)
        .await
        .expect("cancel");

    let initiator = pair.initiator.clone();
    eventually("disconnect", || {
        initiator.view().peer(peer).map(|p| p.state) == Some(ConnectionState::Disconnected)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pair.radio.is_connected());
    assert!(pair.initiator.view().usable.is_empty());
    assert_eq!(pair.responder.view().subscriber_count(target()), 0);
}

#[tokio::test]
async fn test_write_with_response_lands_on_responder() {
    let mut pair = pair(NearlinkConfig::default());
    let peer = establish(&mut pair, "Need water").await;

    pair.initiator
        .write(peer, target(), b"bringing two bottles".to_vec(), WriteKind::WithResponse)
        .await
        .expect("write");

    let responder = pair.responder.clone();
    eventually("write to be stored", || {
        responder.view().values.get(&target()).map(Vec::as_slice)
            == Some(b"bringing two bottles".as_slice())
    })
    .await;
    assert_eq!(pair.initiator.view().errors_raised, 0);
}

#[tokio::test]
async fn test_push_bounded_by_subscriber_mtu() {
    let mut pair = pair(NearlinkConfig::default());
    pair.radio.set_max_update_len(20);
    establish(&mut pair, "Need a ride").await;

    assert_eq!(
        pair.responder
            .update_value(target(), vec![b'x'; 21], vec![])
            .await,
        Err(CoordinatorError::PayloadTooLarge { len: 21, max: 20 })
    );
    pair.responder
        .update_value(target(), vec![b'x'; 20], vec![])
        .await
        .expect("push at the bound");
}

#[tokio::test]
async fn test_full_queue_push_delivered_when_ready() {
    let mut pair = pair(NearlinkConfig::default());
    let peer = establish(&mut pair, "Stuck in snow").await;

    pair.radio.fail_next_updates(1);
    assert_eq!(
        pair.responder
            .update_value(target(), b"shovel coming".to_vec(), vec![])
            .await,
        Err(CoordinatorError::UpdateFailed)
    );
    pair.radio.signal_ready_to_update();

    let initiator = pair.initiator.clone();
    eventually("queued push to drain", || {
        initiator
            .view()
            .trees
            .get(&peer)
            .and_then(|tree| tree.first().cloned())
            .and_then(|s| s.characteristic(&TARGET_CHARACTERISTIC_UUID).cloned())
            .and_then(|c| c.value)
            == Some(b"shovel coming".to_vec())
    })
    .await;
}

#[tokio::test]
async fn test_radio_cycle_recovers_link() {
    let mut pair = pair(NearlinkConfig::default());
    let peer = establish(&mut pair, "Out of fuel").await;

    pair.radio.set_radio_state(RadioState::PoweredOff);
    let initiator = pair.initiator.clone();
    eventually("radio loss", || {
        let view = initiator.view();
        !view.scanning && view.peer(peer).map(|p| p.state) == Some(ConnectionState::Disconnected)
    })
    .await;
    let responder = pair.responder.clone();
    eventually("advertising to pause", || !responder.view().advertising).await;

    pair.radio.set_radio_state(RadioState::PoweredOn);
    eventually("link to come back", || {
        let view = initiator.view();
        view.scanning
            && view.peer(peer).map(|p| p.phase) == Some(DiscoveryPhase::Ready)
            && responder.view().advertising
    })
    .await;
    assert!(pair.requests.try_recv().is_err());
}
