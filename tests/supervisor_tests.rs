
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_lite::cluster::types::{ContainerState, ContainerStatus, ExitStatus, FinalStatus};
use fleet_lite::event::ControlEvent;
use fleet_lite::supervisor::Phase;
use test_harness::*;

/// Instance names bound to containers and instance names waiting on the
/// unused queue must never overlap.
async fn assert_identity_invariant(fleet: &TestFleet) {
    let state = fleet.state.read().await;
    let mut seen: Vec<&str> = state
        .containers
        .values()
        .map(|slot| slot.instance.as_str())
        .chain(state.instances.unused_names())
        .collect();
    let total = seen.len();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), total, "an instance name appears in two places");
}

#[tokio::test]
async fn initial_fill_requests_the_configured_fleet() {
    init_logging();
    let config = test_config().with_initial_containers(2);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    let requests = fleet.rm.requests().await;
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.capability.memory_mbs, 1024);
        assert_eq!(request.capability.vcores, 1);
        assert_eq!(request.priority, 0);
        assert!(request.preferred_nodes.is_empty());
    }

    fleet.stop().await;
}

#[tokio::test]
async fn zero_initial_containers_stops_immediately() {
    let config = test_config().with_initial_containers(0);
    let fleet = TestFleet::start(config).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fleet.rm.requests().await.is_empty());

    let rm = fleet.rm.clone();
    let state = fleet.state.clone();
    fleet.stop().await;

    assert_eq!(rm.unregistered().await, Some(FinalStatus::Succeeded));
    assert_eq!(state.read().await.phase, Phase::Stopped);
}

#[tokio::test]
async fn normal_failure_reuses_the_instance_and_prefers_its_node() {
    let config = test_config().with_initial_containers(1);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    let c1 = fleet.rm.grant_next("h1").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);
    {
        let state = fleet.state.read().await;
        assert_eq!(state.containers[&c1.id].instance, "FleetWorker_1");
    }
    assert_identity_invariant(&fleet).await;

    fleet.rm.complete(&c1.id, ExitStatus::Failed(137), "").await;

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    let requests = fleet.rm.requests().await;
    assert_eq!(requests[1].preferred_nodes, vec!["h1".to_string()]);
    {
        let state = fleet.state.read().await;
        assert_eq!(state.instances.retry_count("FleetWorker_1"), 1);
        assert_eq!(state.instances.unused_len(), 1);
    }

    // The replacement picks the recycled name back up.
    let c2 = fleet.rm.grant_next("h1").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);
    {
        let state = fleet.state.read().await;
        assert_eq!(state.containers[&c2.id].instance, "FleetWorker_1");
        assert_eq!(state.instances.unused_len(), 0);
    }
    assert_identity_invariant(&fleet).await;

    fleet.stop().await;
}

#[tokio::test]
async fn disk_failure_replaces_without_node_affinity() {
    let config = test_config().with_initial_containers(1);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    let c1 = fleet.rm.grant_next("h2").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);

    fleet.rm.complete(&c1.id, ExitStatus::DisksFailed, "").await;

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    assert!(fleet.rm.requests().await[1].preferred_nodes.is_empty());

    fleet.stop().await;
}

#[tokio::test]
async fn aborted_exit_replaces_without_node_affinity() {
    let config = test_config().with_initial_containers(1);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    let c1 = fleet.rm.grant_next("h2").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);

    fleet.rm.complete(&c1.id, ExitStatus::Aborted, "").await;

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    assert!(fleet.rm.requests().await[1].preferred_nodes.is_empty());

    fleet.stop().await;
}

#[tokio::test]
async fn affinity_disabled_never_pins_replacements() {
    let config = test_config()
        .with_initial_containers(1)
        .with_host_affinity(false);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    let c1 = fleet.rm.grant_next("h3").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);

    fleet.rm.complete(&c1.id, ExitStatus::Failed(1), "").await;

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    assert!(fleet.rm.requests().await[1].preferred_nodes.is_empty());

    fleet.stop().await;
}

#[tokio::test]
async fn retry_exhaustion_retires_the_instance() {
    let config = test_config()
        .with_initial_containers(1)
        .with_host_affinity(false)
        .with_max_instance_retries(2);
    let fleet = TestFleet::start(config).await;

    for round in 1..=3 {
        assert!(wait_for_request_count(&fleet.rm, round).await);
        let container = fleet.rm.grant_next("h1").await;
        assert!(wait_for_container_count(&fleet.state, 1).await);
        fleet
            .rm
            .complete(&container.id, ExitStatus::Failed(1), "worker crashed")
            .await;
        assert!(wait_for_container_count(&fleet.state, 0).await);
    }

    // The third completion exceeds the cap: no further request, the name is
    // neither recycled nor running.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.rm.requests().await.len(), 3);
    {
        let state = fleet.state.read().await;
        assert_eq!(state.instances.retry_count("FleetWorker_1"), 3);
        assert_eq!(state.instances.unused_len(), 0);
        assert!(state.containers.is_empty());
    }

    fleet.stop().await;
}

#[tokio::test]
async fn zero_retry_cap_replaces_forever() {
    let config = test_config()
        .with_initial_containers(1)
        .with_host_affinity(false)
        .with_max_instance_retries(0);
    let fleet = TestFleet::start(config).await;

    for round in 1..=4 {
        assert!(wait_for_request_count(&fleet.rm, round).await);
        let container = fleet.rm.grant_next("h1").await;
        assert!(wait_for_container_count(&fleet.state, 1).await);
        fleet
            .rm
            .complete(&container.id, ExitStatus::Failed(1), "")
            .await;
        assert!(wait_for_container_count(&fleet.state, 0).await);
    }

    // A fifth request is still issued.
    assert!(wait_for_request_count(&fleet.rm, 5).await);
    assert_eq!(
        fleet.state.read().await.instances.retry_count("FleetWorker_1"),
        4
    );

    fleet.stop().await;
}

#[tokio::test]
async fn requests_are_clamped_to_the_cluster_maximum() {
    let mut config = test_config()
        .with_initial_containers(1)
        .with_capability(8192, 16);
    config.container_host_affinity_enabled = false;
    let rm = MockResourceManager::new(2048, 8);
    let fleet = TestFleet::start_with(config, rm, MockNodeManager::new()).await;

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    let request = fleet.rm.requests().await[0].clone();
    assert_eq!(request.capability.memory_mbs, 2048);
    assert_eq!(request.capability.vcores, 8);

    // The launched worker's heap follows the granted memory.
    fleet.rm.grant_next("h1").await;
    assert!(wait_for_started_count(&fleet.nm, 1).await);
    let (_, context) = fleet.nm.started().await[0].clone();
    assert!(context.command.contains("-Xmx2048M"), "{}", context.command);

    fleet.stop().await;
}

#[tokio::test]
async fn graceful_stop_drains_the_fleet_and_unregisters() {
    let config = test_config().with_initial_containers(3);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 3).await);
    for _ in 0..3 {
        fleet.rm.grant_next("h1").await;
    }
    assert!(wait_for_container_count(&fleet.state, 3).await);

    // Observe the drain rendezvous the stop sequence rides on.
    let drained = fleet.drained.clone();
    let drain_seen = Arc::new(AtomicBool::new(false));
    let seen = drain_seen.clone();
    let waiter = tokio::spawn(async move {
        drained.notified().await;
        seen.store(true, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rm = fleet.rm.clone();
    let nm = fleet.nm.clone();
    let state = fleet.state.clone();
    fleet.stop().await;

    assert_eq!(nm.stopped().await.len(), 3);
    assert_eq!(rm.unregistered().await, Some(FinalStatus::Succeeded));
    let _ = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(drain_seen.load(Ordering::SeqCst));
    let state = state.read().await;
    assert!(state.containers.is_empty());
    assert_eq!(state.phase, Phase::Stopped);
}

#[tokio::test]
async fn stop_timeout_still_unregisters_with_a_stuck_container() {
    let mut config = test_config().with_initial_containers(1);
    config.stop_timeout = Duration::from_millis(200);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    fleet.rm.grant_next("h1").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);

    fleet.nm.set_hang_stop(true);
    let rm = fleet.rm.clone();
    let state = fleet.state.clone();
    fleet.stop().await;

    assert_eq!(rm.unregistered().await, Some(FinalStatus::Succeeded));
    // The record never drained; the timeout let unregistration proceed.
    assert_eq!(state.read().await.containers.len(), 1);
}

#[tokio::test]
async fn double_delivery_of_a_completion_takes_one_decision() {
    let config = test_config()
        .with_initial_containers(1)
        .with_host_affinity(false);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    let c1 = fleet.rm.grant_next("h1").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);

    // The same completion arrives through the resource manager callback and
    // through a node manager status query.
    let status = ContainerStatus {
        container_id: c1.id.clone(),
        state: ContainerState::Complete,
        exit_status: ExitStatus::Failed(1),
        diagnostics: String::new(),
    };
    fleet.nm.set_status(status).await;
    fleet.rm.complete(&c1.id, ExitStatus::Failed(1), "").await;
    fleet.nm_client.container_status(c1.id.clone(), c1.node.clone());

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one replacement request and one recorded retry.
    assert_eq!(fleet.rm.requests().await.len(), 2);
    {
        let state = fleet.state.read().await;
        assert_eq!(state.instances.retry_count("FleetWorker_1"), 1);
        assert_eq!(state.instances.unused_len(), 1);
    }

    fleet.stop().await;
}

#[tokio::test]
async fn completion_before_the_start_callback_is_tolerated() {
    let config = test_config()
        .with_initial_containers(1)
        .with_host_affinity(false);
    let fleet = TestFleet::start(config).await;
    fleet.nm.set_hang_start(true);

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    let c1 = fleet.rm.grant_next("h1").await;
    assert!(wait_for_container_count(&fleet.state, 1).await);

    // The container dies before its start call ever reports back.
    fleet.rm.complete(&c1.id, ExitStatus::Failed(143), "").await;

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    assert!(wait_for_container_count(&fleet.state, 0).await);

    fleet.stop().await;
}

#[tokio::test]
async fn start_error_removes_the_record_without_replacement() {
    let config = test_config().with_initial_containers(1);
    let fleet = TestFleet::start(config).await;
    fleet.nm.set_fail_start(true);

    assert!(wait_for_request_count(&fleet.rm, 1).await);
    fleet.rm.grant_next("h1").await;

    // The record appears on allocation and goes away on the start error.
    assert!(wait_for_container_count(&fleet.state, 0).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.rm.requests().await.len(), 1);
    assert_eq!(fleet.state.read().await.instances.unused_len(), 0);

    fleet.stop().await;
}

#[tokio::test]
async fn rm_shutdown_request_stops_the_supervisor() {
    let config = test_config().with_initial_containers(0);
    let fleet = TestFleet::start(config).await;
    let mut host_events = fleet.bus.subscribe();

    fleet.rm.request_shutdown().await;

    assert_eq!(
        wait_for_unregister(&fleet.rm).await,
        Some(FinalStatus::Succeeded)
    );
    match host_events.try_recv() {
        Ok(ControlEvent::ApplicationMasterShutdownRequest) => {}
        other => panic!("expected a shutdown request on the bus, got {:?}", other),
    }
    fleet.join().await;
}

#[tokio::test]
async fn rm_transport_error_stops_the_supervisor() {
    let config = test_config().with_initial_containers(0);
    let fleet = TestFleet::start(config).await;
    let mut host_events = fleet.bus.subscribe();

    fleet.rm.fail_heartbeats().await;

    assert_eq!(
        wait_for_unregister(&fleet.rm).await,
        Some(FinalStatus::Succeeded)
    );
    match host_events.try_recv() {
        Ok(ControlEvent::ApplicationMasterShutdownRequest) => {}
        other => panic!("expected a shutdown request on the bus, got {:?}", other),
    }
    fleet.join().await;
}

#[tokio::test]
async fn shutdown_request_on_the_bus_stops_the_supervisor() {
    let config = test_config().with_initial_containers(0);
    let fleet = TestFleet::start(config).await;

    fleet
        .bus
        .publish(ControlEvent::ApplicationMasterShutdownRequest);

    assert_eq!(
        wait_for_unregister(&fleet.rm).await,
        Some(FinalStatus::Succeeded)
    );
    fleet.join().await;
}

#[tokio::test]
async fn container_shutdown_request_stops_only_the_named_containers() {
    let config = test_config().with_initial_containers(2);
    let fleet = TestFleet::start(config).await;

    assert!(wait_for_request_count(&fleet.rm, 2).await);
    let c1 = fleet.rm.grant_next("h1").await;
    let _c2 = fleet.rm.grant_next("h2").await;
    assert!(wait_for_container_count(&fleet.state, 2).await);

    fleet.bus.publish(ControlEvent::ContainerShutdownRequest {
        containers: vec![c1.clone()],
    });

    assert!(wait_for_stopped_count(&fleet.nm, 1).await);
    assert_eq!(fleet.nm.stopped().await, vec![c1.id.clone()]);
    assert!(wait_for_container_count(&fleet.state, 1).await);

    // A plain stop is not a completion: no replacement request goes out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.rm.requests().await.len(), 2);

    fleet.stop().await;
}

#[tokio::test]
async fn requests_before_registration_are_dropped() {
    let config = test_config();
    let fleet = TestFleet::start_without_registration(config).await;

    fleet.bus.publish(ControlEvent::NewContainerRequest {
        replaced_container: None,
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fleet.rm.requests().await.is_empty());

    fleet.stop().await;
}
