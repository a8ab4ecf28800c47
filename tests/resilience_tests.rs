mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use jobmesh::error::DbError;
use jobmesh::model::{JobRequest, State};
use jobmesh::scheduler::PollerStatus;
use jobmesh::Database;
use test_harness::{test_config, wait_for, FlakyGateway, TestCluster, DEFAULT_QUEUE};

fn cluster_with_node() -> TestCluster {
    let cluster = TestCluster::new();
    cluster.add_node(1, "n1");
    cluster.deploy(1, 1, DEFAULT_QUEUE, 2, 10);
    cluster.define(1, "slow", "slow");
    cluster.define(2, "app", "ok");
    cluster
}

/// A result computed while the database is down is stored once it is back, exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_lost_result_under_outage() {
    let cluster = cluster_with_node();
    let engine = cluster.start_engine("n1").await;

    let request = JobRequest::new("slow").with_parameter("ms", "150");
    let id = cluster.db.enqueue(request).await.unwrap();
    assert!(cluster.wait_for_state(id, State::Running, Duration::from_secs(2)).await);

    cluster.db.set_reachable(false);
    assert!(
        wait_for(
            || async { engine.deferred_finalizations() == 1 },
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await,
        "finished instance should wait for the database"
    );
    assert!(engine.is_reconnecting());
    assert_eq!(cluster.live_state(id), Some(State::Running));
    assert_eq!(cluster.history_count(id), 0);

    cluster.db.set_reachable(true);
    let history = cluster.wait_for_history(id, Duration::from_secs(3)).await.unwrap();
    assert_eq!(history.state, State::Ended);
    assert_eq!(cluster.history_count(id), 1);
    assert!(cluster.live_state(id).is_none());

    assert!(
        wait_for(
            || async { !engine.is_reconnecting() },
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await,
        "reconnection loop should terminate"
    );
    assert_eq!(engine.deferred_finalizations(), 0);

    engine.stop().await;
}

/// Pollers faulted by an outage are restarted and claim again afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pollers_restart_after_outage() {
    let cluster = cluster_with_node();
    let engine = cluster.start_engine("n1").await;
    let poller = engine.poller(1).await.unwrap();

    cluster.db.set_reachable(false);
    assert!(
        wait_for(
            || async { poller.status() == PollerStatus::Faulted },
            Duration::from_secs(2),
            Duration::from_millis(5)
        )
        .await,
        "poller should fault"
    );
    assert!(!engine.is_up_and_running().await);

    cluster.db.set_reachable(true);
    assert!(
        wait_for(
            || async { poller.status() == PollerStatus::Polling },
            Duration::from_secs(2),
            Duration::from_millis(5)
        )
        .await,
        "poller should be restarted"
    );

    let id = cluster.enqueue("app").await;
    let history = cluster.wait_for_history(id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(history.state, State::Ended);

    assert!(
        wait_for(
            || async { engine.is_up_and_running().await },
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await
    );
    engine.stop().await;
}

/// The heartbeat resumes stamping after an outage.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_resumes_after_outage() {
    let cluster = cluster_with_node();
    let engine = cluster.start_engine("n1").await;

    cluster.db.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let frozen = cluster.db.node_snapshot(1).unwrap().last_seen_alive.unwrap();
    cluster.db.set_reachable(true);

    assert!(
        wait_for(
            || async { cluster.db.node_snapshot(1).unwrap().last_seen_alive.unwrap() > frozen },
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await,
        "heartbeat should stamp again"
    );
    engine.stop().await;
}

/// stop() issued during an outage waits for the deferred result before returning.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_during_outage_waits_for_deferred_result() {
    let cluster = cluster_with_node();
    let engine = cluster.start_engine("n1").await;

    let request = JobRequest::new("slow").with_parameter("ms", "100");
    let id = cluster.db.enqueue(request).await.unwrap();
    assert!(cluster.wait_for_state(id, State::Running, Duration::from_secs(2)).await);

    cluster.db.set_reachable(false);
    assert!(
        wait_for(
            || async { engine.deferred_finalizations() == 1 },
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await
    );

    let stopping = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!stopping.is_finished(), "stop must wait for the deferred result");
    assert!(!engine.has_ended());

    cluster.db.set_reachable(true);
    tokio::time::timeout(Duration::from_secs(3), stopping)
        .await
        .expect("stop should complete once the database is back")
        .unwrap();

    assert_eq!(cluster.history(id).unwrap().state, State::Ended);
    assert!(cluster.db.live_instances().unwrap().is_empty());
    let node = cluster.db.node_snapshot(1).unwrap();
    assert!(node.last_seen_alive.is_none());
}

/// Several outages in a row are each recovered from.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_outages() {
    let cluster = cluster_with_node();
    let engine = cluster.start_engine("n1").await;

    for _ in 0..3 {
        cluster.db.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        cluster.db.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    let id = cluster.enqueue("app").await;
    let history = cluster.wait_for_history(id, Duration::from_secs(3)).await.unwrap();
    assert_eq!(history.state, State::Ended);
    assert_eq!(cluster.history_count(id), 1);

    engine.stop().await;
}

/// Losing the database while a claimed instance is being prepared delays its start; the
/// instance still runs once and ends normally.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outage_before_start_defers_the_start() {
    let cluster = cluster_with_node();
    cluster.define(3, "rec", "record");
    let gateway = FlakyGateway::new(Arc::clone(&cluster.db));
    let engine = cluster
        .start_engine_on("n1", gateway.clone(), test_config())
        .await;

    gateway.fail_instance_reads(1);
    let id = cluster.enqueue("rec").await;
    let history = cluster.wait_for_history(id, Duration::from_secs(3)).await.unwrap();

    assert_eq!(history.state, State::Ended);
    assert_eq!(cluster.history_count(id), 1);
    assert_eq!(*cluster.started.lock().unwrap(), vec![id]);
    let messages = cluster.db.messages_for(id).unwrap();
    assert!(
        messages.iter().all(|m| !m.contains("could not be prepared")),
        "{messages:?}"
    );

    assert!(
        wait_for(
            || async { !engine.is_reconnecting() },
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await
    );
    assert_eq!(engine.deferred_starts(), 0);
    engine.stop().await;
}

/// A result refused once by the database is stored on the retry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refused_result_is_retried() {
    let cluster = cluster_with_node();
    let gateway = FlakyGateway::new(Arc::clone(&cluster.db));
    let engine = cluster
        .start_engine_on("n1", gateway.clone(), test_config())
        .await;

    gateway.fail_finalizations(1, DbError::Query("deadlock detected".into()));
    let id = cluster.enqueue("app").await;
    let history = cluster.wait_for_history(id, Duration::from_secs(2)).await.unwrap();

    assert_eq!(history.state, State::Ended);
    assert_eq!(cluster.history_count(id), 1);
    assert!(cluster.live_state(id).is_none());
    engine.stop().await;
}

/// A result the database keeps refusing is replaced by a crashed record, so the instance does
/// not stay running on a live node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_result_refused_twice_is_recorded_as_crashed() {
    let cluster = cluster_with_node();
    let gateway = FlakyGateway::new(Arc::clone(&cluster.db));
    let engine = cluster
        .start_engine_on("n1", gateway.clone(), test_config())
        .await;
    let poller = engine.poller(1).await.unwrap();

    gateway.fail_finalizations(2, DbError::Query("value too long".into()));
    let id = cluster.enqueue("app").await;
    let history = cluster.wait_for_history(id, Duration::from_secs(2)).await.unwrap();

    assert_eq!(history.state, State::Crashed);
    assert!(cluster.live_state(id).is_none());
    let messages = cluster.db.messages_for(id).unwrap();
    assert!(
        messages.iter().any(|m| m.contains("value too long")),
        "{messages:?}"
    );
    assert!(
        wait_for(
            || async { poller.running_count() == 0 },
            Duration::from_secs(1),
            Duration::from_millis(5)
        )
        .await
    );
    engine.stop().await;
}

/// Stopping while only the heartbeat waits for the database ends the engine, and recovery
/// does not bring the heartbeat of the ended engine back.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_during_heartbeat_outage_keeps_heartbeat_stopped() {
    let cluster = TestCluster::new();
    cluster.add_node(1, "n1");
    let engine = cluster.start_engine("n1").await;

    cluster.db.set_reachable(false);
    assert!(
        wait_for(
            || async { engine.is_reconnecting() },
            Duration::from_secs(2),
            Duration::from_millis(5)
        )
        .await,
        "heartbeat should report the outage"
    );
    tokio::time::timeout(Duration::from_secs(2), engine.stop())
        .await
        .expect("stop should not wait for the database");
    assert!(engine.has_ended());

    cluster.db.set_reachable(true);
    assert!(
        wait_for(
            || async { !engine.is_reconnecting() },
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await
    );
    let stamped = cluster.db.node_snapshot(1).unwrap().last_seen_alive;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.db.node_snapshot(1).unwrap().last_seen_alive, stamped);

    let restarted = cluster.start_engine("n1").await;
    restarted.stop().await;
}
