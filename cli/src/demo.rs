// Loopback demonstration session
//
// A responder publishes a help request as the user description of the
// protocol characteristic and advertises it. An initiator scans, connects on
// sight and walks the tree. Each forced link drop makes the initiator
// reconnect and read the request again; the dedupe window keeps those
// repeats from reaching the user.
//
// A relaunch snapshot may be adopted first. The help service is always
// republished by the demo, so restored copies of it are dropped.

use anyhow::{Context, Result};
use nearlink_core::transport::LoopbackRadio;
use nearlink_core::{
    spawn_initiator, spawn_responder, CharRef, Characteristic, Descriptor, DiscoveryPhase,
    InitiatorCoordinator, InitiatorHandle, NearlinkConfig, PeerId, Permission, Property,
    RemoteRequest, RestorationSnapshot, ResponderCoordinator, ResponderHandle, ScanFilter,
    Service,
};
use uuid::Uuid;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::info;

const POLL: Duration = Duration::from_millis(10);

pub struct DemoOptions {
    pub text: String,
    /// Forced link drops after the first delivery
    pub repeat: u32,
    pub config: NearlinkConfig,
    pub wait: Duration,
    /// State to adopt before the session starts
    pub restore: Option<RestorationSnapshot>,
}

#[derive(Debug)]
pub struct DemoReport {
    pub peer: PeerId,
    pub delivered: Vec<RemoteRequest>,
    pub reconnects: u32,
    /// Services the responder published when the session ended
    pub published: Vec<Uuid>,
}

fn help_service(config: &NearlinkConfig, text: &str) -> Service {
    Service::new(
        config.protocol.service_uuid,
        true,
        vec![Characteristic::new(
            config.protocol.characteristic_uuid,
            [Property::Read, Property::Write, Property::Notify],
        )
        .with_permissions([Permission::Readable, Permission::Writeable])
        .with_descriptor(Descriptor::user_description(text))],
    )
}

pub async fn run(options: DemoOptions) -> Result<DemoReport> {
    let config = options.config;
    anyhow::ensure!(
        config.initiator.auto_connect && config.initiator.auto_subscribe,
        "demo needs initiator.auto_connect and initiator.auto_subscribe enabled"
    );
    let (radio, central_rx, peripheral_rx) = LoopbackRadio::new();
    let (request_tx, mut requests) = mpsc::unbounded_channel();

    let initiator = InitiatorCoordinator::new(
        config.initiator.clone(),
        config.protocol,
        Arc::new(radio.clone()),
    )
    .with_request_sink(request_tx);
    let responder = ResponderCoordinator::new(config.responder.clone(), Arc::new(radio.clone()));
    let (initiator, initiator_task) = spawn_initiator(initiator, central_rx);
    let (responder, responder_task) = spawn_responder(responder, peripheral_rx);

    if let Some(snapshot) = options.restore.filter(|s| !s.is_empty()) {
        let (central, peripheral) = snapshot.into_parts();
        if let Some(central) = central {
            initiator
                .restore(central)
                .await
                .context("Initiator rejected the snapshot")?;
        }
        if let Some(mut peripheral) = peripheral {
            let help = config.protocol.service_uuid;
            peripheral.services.retain(|s| s.uuid != help);
            peripheral.subscriptions.retain(|s| s.characteristic.service != help);
            info!("Adopting {} restored services", peripheral.services.len());
            responder
                .restore(peripheral)
                .await
                .context("Responder rejected the snapshot")?;
        }
    }

    responder
        .add_service(help_service(&config, &options.text))
        .await
        .context("Responder rejected the help service")?;
    responder
        .start_advertising()
        .await
        .context("Responder could not advertise")?;
    initiator
        .start_scan(ScanFilter::for_service(config.protocol.service_uuid))
        .await
        .context("Initiator could not scan")?;

    let first = timeout(options.wait, requests.recv())
        .await
        .context("No request discovered in time")?
        .context("Initiator stopped before delivering")?;
    info!("Request from {}: {}", first.peer, first.text);
    let peer = first.peer;
    let mut delivered = vec![first];

    let target = CharRef::new(
        config.protocol.service_uuid,
        config.protocol.characteristic_uuid,
    );
    wait_ready(&initiator, &responder, peer, target, 1, options.wait).await?;

    let mut reconnects = 0;
    for round in 1..=options.repeat {
        let generation = responder.view().subscription_generation;
        radio.drop_link(Some("demo link drop".to_string()));
        wait_ready(&initiator, &responder, peer, target, generation + 2, options.wait)
            .await
            .with_context(|| format!("Reconnect {} did not complete", round))?;
        reconnects += 1;
        while let Ok(request) = requests.try_recv() {
            delivered.push(request);
        }
    }

    let published = responder.view().published.iter().map(|s| s.uuid).collect();
    initiator.shutdown().await?;
    responder.shutdown().await?;
    let _ = initiator_task.await;
    let _ = responder_task.await;

    Ok(DemoReport {
        peer,
        delivered,
        reconnects,
        published,
    })
}

/// Wait for the initiator to finish discovery with its subscription in place
async fn wait_ready(
    initiator: &InitiatorHandle,
    responder: &ResponderHandle,
    peer: PeerId,
    target: CharRef,
    generation: u64,
    wait: Duration,
) -> Result<()> {
    let settled = async {
        loop {
            let subscribed = responder.view().subscription_generation >= generation
                && responder.view().subscriber_count(target) > 0;
            let ready = initiator.view().peer(peer).map(|p| p.phase) == Some(DiscoveryPhase::Ready);
            if subscribed && ready {
                return;
            }
            sleep(POLL).await;
        }
    };
    timeout(wait, settled)
        .await
        .context("Timed out waiting for discovery to settle")
}
