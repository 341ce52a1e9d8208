//! Integration tests for the reconciliation flow.
//!
//! Drive `SyncReconciler` against a scripted authority and the mock routing
//! engine, checking which driver calls a tick makes and what state it leaves.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{address, network, peer, TestAgent};
use dynroute_agent::driver::DriverCall;
use dynroute_agent::ReconcilerConfig;
use dynroute_events::{AgentNotification, InstanceRef, PeerRemoval};
use dynroute_id::{PeerId, RoutingInstanceId};
use dynroute_networking::AsNumber;
use dynroute_reconcile::ConvergenceStatus;
use proptest::prelude::*;

fn sorted(ids: &[PeerId]) -> Vec<PeerId> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_tick_applies_symmetric_difference() {
    let agent = TestAgent::new();
    let (p1, p2, p3) = (peer(1), peer(2), peer(3));
    agent.preload(&p1).await;
    agent.preload(&p2).await;
    agent.driver.clear_calls();

    agent.authority.set_peers(vec![p2.clone(), p3.clone()]);
    let report = agent.reconciler.tick().await;

    assert_eq!(
        agent.driver.calls(),
        vec![
            DriverCall::RemovePeer(p1.peer_address),
            DriverCall::AddPeer(p3.peer_address),
        ]
    );
    assert_eq!(agent.peer_ids().await, sorted(&[p2.id, p3.id]));
    assert_eq!(report.peers_added, 1);
    assert_eq!(report.peers_removed, 1);
    assert_eq!(report.status, ConvergenceStatus::Converged);
    assert!(!agent.full_sync_requested().await);
}

#[tokio::test]
async fn test_tick_is_noop_until_full_sync_requested() {
    let agent = TestAgent::new();
    agent.authority.set_peers(vec![peer(1)]);

    let first = agent.reconciler.tick().await;
    assert!(!first.skipped);
    let pulls = agent.authority.pulls();
    agent.driver.clear_calls();

    // The authority changed but nobody asked for a sync.
    agent.authority.set_peers(vec![peer(2)]);
    let second = agent.reconciler.tick().await;
    assert!(second.skipped);
    assert_eq!(agent.authority.pulls(), pulls);
    assert!(agent.driver.calls().is_empty());

    agent.reconciler.request_full_sync().await;
    let third = agent.reconciler.tick().await;
    assert!(!third.skipped);
    assert_eq!(third.peers_added, 1);
    assert_eq!(third.peers_removed, 1);
}

#[tokio::test]
async fn test_remove_of_unknown_session_is_tolerated() {
    let agent = TestAgent::new();
    let (p1, p2) = (peer(1), peer(2));
    // Locally believed active, but the engine has already dropped them.
    for p in [&p1, &p2] {
        agent
            .reconciler
            .state()
            .lock()
            .await
            .insert_peer(p.id, dynroute_agent::PeerSession::from(p));
    }

    let report = agent.reconciler.tick().await;

    assert_eq!(report.peers_removed, 2);
    assert_eq!(report.failures, 0);
    assert!(agent.peer_ids().await.is_empty());
    assert_eq!(report.status, ConvergenceStatus::Converged);
}

#[tokio::test]
async fn test_driver_failure_is_isolated_per_peer() {
    let agent = TestAgent::new();
    let (p1, p2, p3) = (peer(1), peer(2), peer(3));
    agent
        .authority
        .set_peers(vec![p1.clone(), p2.clone(), p3.clone()]);
    agent.driver.fail_peer(p2.peer_address);

    let report = agent.reconciler.tick().await;

    assert_eq!(report.peers_added, 2);
    assert_eq!(report.failures, 1);
    assert_eq!(report.status, ConvergenceStatus::Converging);
    assert_eq!(agent.peer_ids().await, sorted(&[p1.id, p3.id]));
    assert!(agent.full_sync_requested().await);

    // The next tick is the retry.
    agent.driver.heal();
    agent.driver.clear_calls();
    let report = agent.reconciler.tick().await;

    assert_eq!(agent.driver.calls(), vec![DriverCall::AddPeer(p2.peer_address)]);
    assert_eq!(report.status, ConvergenceStatus::Converged);
    assert_eq!(agent.peer_ids().await, sorted(&[p1.id, p2.id, p3.id]));
}

#[tokio::test]
async fn test_unreachable_authority_leaves_state_alone() {
    let agent = TestAgent::new();
    let p1 = peer(1);
    agent.preload(&p1).await;
    agent.driver.clear_calls();
    agent.authority.set_reachable(false);

    let report = agent.reconciler.tick().await;

    assert_eq!(report.status, ConvergenceStatus::Unknown);
    assert!(agent.driver.calls().is_empty());
    assert_eq!(agent.peer_ids().await, vec![p1.id]);
    assert!(agent.full_sync_requested().await);
}

#[tokio::test]
async fn test_slow_authority_times_out() {
    let agent = TestAgent::with_config(ReconcilerConfig {
        authority_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    agent.authority.set_peers(vec![peer(1)]);
    agent.authority.set_delay(Some(Duration::from_secs(5)));

    let started = std::time::Instant::now();
    let report = agent.reconciler.tick().await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.status, ConvergenceStatus::Unknown);
    assert!(agent.peer_ids().await.is_empty());
}

#[tokio::test]
async fn test_slow_driver_call_counts_as_failure() {
    let agent = TestAgent::with_config(ReconcilerConfig {
        driver_timeout: Duration::from_millis(20),
        ..Default::default()
    });
    agent.authority.set_peers(vec![peer(1)]);
    agent.driver.set_delay(Some(Duration::from_secs(5)));

    let report = agent.reconciler.tick().await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.status, ConvergenceStatus::Converging);
    assert!(agent.driver.sessions().is_empty());
}

#[tokio::test]
async fn test_changed_session_is_readded() {
    let agent = TestAgent::new();
    let p1 = peer(1);
    agent.preload(&p1).await;
    agent.driver.clear_calls();

    let mut updated = p1.clone();
    updated.remote_as = AsNumber::new(64999).unwrap();
    agent.authority.set_peers(vec![updated.clone()]);
    agent.reconciler.tick().await;

    assert_eq!(
        agent.driver.calls(),
        vec![
            DriverCall::RemovePeer(p1.peer_address),
            DriverCall::AddPeer(p1.peer_address),
        ]
    );
    assert_eq!(
        agent.driver.sessions()[&p1.peer_address].remote_as,
        updated.remote_as
    );
}

#[tokio::test]
async fn test_secret_change_is_readded_on_full_sync() {
    let agent = TestAgent::new();
    let p1 = peer(1);
    agent.authority.set_peers(vec![p1.clone()]);
    agent.reconciler.tick().await;
    assert!(!agent.driver.sessions()[&p1.peer_address].authenticated);

    let mut updated = p1.clone();
    updated.secret = Some("s3cret".to_string());
    agent.authority.set_peers(vec![updated]);
    agent.reconciler.request_full_sync().await;
    agent.driver.clear_calls();
    let report = agent.reconciler.tick().await;

    assert_eq!(
        agent.driver.calls(),
        vec![
            DriverCall::RemovePeer(p1.peer_address),
            DriverCall::AddPeer(p1.peer_address),
        ]
    );
    assert_eq!(report.peers_added, 1);
    assert_eq!(report.status, ConvergenceStatus::Converged);
    assert!(agent.driver.sessions()[&p1.peer_address].authenticated);

    // Clearing the secret is a change too.
    agent.authority.set_peers(vec![p1.clone()]);
    agent.reconciler.request_full_sync().await;
    agent.reconciler.tick().await;
    assert!(!agent.driver.sessions()[&p1.peer_address].authenticated);
}

#[tokio::test]
async fn test_pushed_secret_change_replaces_session() {
    let agent = TestAgent::new();
    let p1 = peer(1);
    agent.reconciler.on_peer_added(&p1).await;

    let mut updated = p1.clone();
    updated.secret = Some("s3cret".to_string());
    agent.driver.clear_calls();
    agent.reconciler.on_peer_added(&updated).await;

    assert_eq!(
        agent.driver.calls(),
        vec![
            DriverCall::RemovePeer(p1.peer_address),
            DriverCall::AddPeer(p1.peer_address),
        ]
    );
    assert!(agent.driver.sessions()[&p1.peer_address].authenticated);
    let state = agent.reconciler.state().lock().await;
    assert_eq!(state.peer(p1.id).unwrap().secret.as_deref(), Some("s3cret"));
}

#[tokio::test]
async fn test_advertise_networks_converge() {
    let agent = TestAgent::new();
    agent.authority.set_networks(vec![
        network("10.0.0.0/24", Some("192.0.2.254")),
        network("10.1.0.0/24", Some("192.0.2.254")),
    ]);

    let report = agent.reconciler.tick().await;
    assert_eq!(report.routes_advertised, 2);
    assert_eq!(agent.driver.routes().len(), 2);

    agent.authority.set_networks(vec![
        network("10.1.0.0/24", Some("192.0.2.254")),
        network("10.2.0.0/24", None),
    ]);
    agent.reconciler.request_full_sync().await;
    agent.driver.clear_calls();
    let report = agent.reconciler.tick().await;

    assert_eq!(
        agent.driver.calls(),
        vec![
            DriverCall::WithdrawRoute("10.0.0.0/24".parse().unwrap()),
            DriverCall::AdvertiseRoute("10.2.0.0/24".parse().unwrap()),
        ]
    );
    assert_eq!(report.routes_withdrawn, 1);
    assert_eq!(report.routes_advertised, 1);

    let state = agent.reconciler.state().lock().await;
    let cidrs: Vec<String> = state
        .advertise_networks()
        .iter()
        .map(|n| n.cidr.to_string())
        .collect();
    assert_eq!(cidrs, vec!["10.1.0.0/24", "10.2.0.0/24"]);
}

#[tokio::test]
async fn test_next_hop_change_readvertises_prefix() {
    let agent = TestAgent::new();
    agent
        .authority
        .set_networks(vec![network("10.0.0.0/24", Some("192.0.2.1"))]);
    agent.reconciler.tick().await;

    agent
        .authority
        .set_networks(vec![network("10.0.0.0/24", Some("192.0.2.2"))]);
    agent.reconciler.request_full_sync().await;
    agent.reconciler.tick().await;

    let routes = agent.driver.routes();
    assert_eq!(
        routes[&"10.0.0.0/24".parse().unwrap()],
        Some("192.0.2.2".parse().unwrap())
    );
    assert_eq!(
        agent.reconciler.state().lock().await.advertise_networks().len(),
        1
    );
}

#[tokio::test]
async fn test_pushed_peer_add_and_remove() {
    let agent = TestAgent::new();
    let p1 = peer(1);

    agent
        .reconciler
        .handle(AgentNotification::AddRoutingpeer(p1.clone()))
        .await;
    assert_eq!(agent.peer_ids().await, vec![p1.id]);
    assert!(agent.driver.sessions().contains_key(&p1.peer_address));

    // Duplicate delivery is harmless.
    agent.driver.clear_calls();
    agent.reconciler.on_peer_added(&p1).await;
    assert!(agent.driver.calls().is_empty());

    agent
        .reconciler
        .handle(AgentNotification::RemoveRoutingpeer(PeerRemoval {
            peer_id: p1.id,
            peer_address: p1.peer_address,
            remote_as: p1.remote_as,
        }))
        .await;
    assert!(agent.peer_ids().await.is_empty());
    assert!(agent.driver.sessions().is_empty());
}

#[tokio::test]
async fn test_pushed_failure_requests_full_sync() {
    let agent = TestAgent::new();
    agent.reconciler.tick().await;
    assert!(!agent.full_sync_requested().await);

    let p1 = peer(1);
    agent.driver.fail_peer(p1.peer_address);
    agent.reconciler.on_peer_added(&p1).await;

    assert!(agent.peer_ids().await.is_empty());
    assert!(agent.full_sync_requested().await);
}

#[tokio::test]
async fn test_instance_notification_requests_full_sync() {
    let agent = TestAgent::new();
    agent.reconciler.tick().await;
    assert!(!agent.full_sync_requested().await);

    agent
        .reconciler
        .handle(AgentNotification::AddRoutinginstance(InstanceRef {
            routing_instance_id: RoutingInstanceId::new(),
        }))
        .await;

    assert!(agent.full_sync_requested().await);
}

#[tokio::test]
async fn test_run_loop_converges_and_stops() {
    let agent = std::sync::Arc::new(TestAgent::with_config(ReconcilerConfig {
        sync_interval: Duration::from_millis(20),
        ..Default::default()
    }));
    let p1 = peer(1);
    agent.authority.set_peers(vec![p1.clone()]);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn({
        let agent = agent.clone();
        async move { agent.reconciler.run(shutdown_rx).await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while agent.peer_ids().await.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.peer_ids().await, vec![p1.id]);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tick_converges_to_authority(
        local in proptest::collection::btree_set(1u8..=12, 0..8),
        remote in proptest::collection::btree_set(1u8..=12, 0..8),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let agent = TestAgent::new();
            let pool: Vec<_> = (0u8..=12).map(peer).collect();

            for n in &local {
                agent.preload(&pool[usize::from(*n)]).await;
            }
            agent.driver.clear_calls();
            agent.authority.set_peers(
                remote.iter().map(|n| pool[usize::from(*n)].clone()).collect(),
            );

            let report = agent.reconciler.tick().await;

            let expected: BTreeSet<PeerId> =
                remote.iter().map(|n| pool[usize::from(*n)].id).collect();
            let actual: BTreeSet<PeerId> = agent.peer_ids().await.into_iter().collect();
            prop_assert_eq!(actual, expected);

            let addresses: BTreeSet<_> = remote.iter().map(|n| address(*n)).collect();
            let sessions: BTreeSet<_> = agent.driver.sessions().into_keys().collect();
            prop_assert_eq!(sessions, addresses);

            prop_assert_eq!(report.peers_added, remote.difference(&local).count());
            prop_assert_eq!(report.peers_removed, local.difference(&remote).count());
            prop_assert_eq!(agent.driver.calls().len(), report.peers_added + report.peers_removed);
            Ok(())
        })?;
    }
}
