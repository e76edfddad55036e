mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use vehicle_persist::{
    Condition, EngineConfig, JournalStore, LiveProperties, PersistError, ReplayLoader, Vec3,
    WorldHandle,
};

fn quick_config() -> EngineConfig {
    EngineConfig::new().spawn_delay(Duration::from_millis(1))
}

#[tokio::test]
async fn vehicles_survive_restart() {
    let dir = tempdir().unwrap();

    {
        let store = Arc::new(JournalStore::open(dir.path()).unwrap());
        let h = harness_with(quick_config(), store, None);
        assert_eq!(h.engine.start().await.unwrap(), 0);

        let record = vehicle("ABC123", "x")
            .at(Vec3::new(10.0, 20.0, 30.0), 45.0)
            .with_configuration(vec![1, 2, 3])
            .with_condition(Condition {
                fuel: 61.0,
                body_health: 700.0,
                engine_health: 900.0,
            });
        h.engine.record_parked("char:owner", record).await;
        h.engine
            .record_parked("char:owner", vehicle("DRV1", "x").in_use(true))
            .await;
        h.engine.record_parked("char:owner", vehicle("TMP1", "x")).await;
        h.engine.record_destroyed("TMP1").await;

        let report = h.engine.shutdown().await.unwrap();
        assert_eq!(report.still_pending, 0);
    }

    let store = Arc::new(JournalStore::open(dir.path()).unwrap());
    let h = harness_with(quick_config(), store, None);
    assert_eq!(h.engine.start().await.unwrap(), 2);

    let replay = h.engine.wait_for_replay().await.unwrap().unwrap();
    assert_eq!(replay.spawned, 2);

    let restored = h.engine.get("ABC123").await.unwrap();
    assert_eq!(restored.owner_id.as_str(), "char:owner");
    assert_eq!(restored.position, Vec3::new(10.0, 20.0, 30.0));
    assert_eq!(restored.configuration, vec![1, 2, 3]);
    assert_eq!(restored.condition.fuel, 61.0);
    // Loaded records are parked.
    assert!(!h.engine.get("DRV1").await.unwrap().being_used);
    assert!(h.engine.get("TMP1").await.is_none());

    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_twice_is_refused() {
    let (h, _store) = harness(quick_config());
    h.engine.start().await.unwrap();
    assert!(matches!(
        h.engine.start().await,
        Err(PersistError::AlreadyRunning(_))
    ));
    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn replay_is_serialized_with_delay_and_binds_handles() {
    let (h, _store) = harness(quick_config());
    for raw in ["R1", "R2", "R3"] {
        h.engine.record_parked("char:r", vehicle(raw, "x")).await;
    }
    let records = h.engine.list_all().await;

    let loader = ReplayLoader::new(
        h.materializer.clone(),
        h.engine.registry().clone(),
        h.engine.gateway().publisher().clone(),
        Duration::from_millis(30),
    );
    let report = loader.replay(records).await.unwrap();
    assert_eq!(report.spawned, 3);

    let spawns = h.materializer.spawns.lock().unwrap().clone();
    for pair in spawns.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(30));
    }

    for raw in ["R1", "R2", "R3"] {
        let handle = h.engine.gateway().publisher().handle(&plate(raw)).await;
        let handle = handle.unwrap();
        assert!(h.observer.last_for(handle).unwrap().tracked);
    }
}

#[tokio::test]
async fn replay_rejects_concurrent_run_and_skips_removed() {
    let (h, _store) = harness(quick_config());
    for raw in ["S1", "S2", "S3"] {
        h.engine.record_parked("char:s", vehicle(raw, "x")).await;
    }
    h.materializer.fail_for("S3");
    let mut records = h.engine.list_all().await;
    records.sort_by(|a, b| a.id.cmp(&b.id));

    let loader = Arc::new(ReplayLoader::new(
        h.materializer.clone(),
        h.engine.registry().clone(),
        h.engine.gateway().publisher().clone(),
        Duration::from_millis(100),
    ));

    let running = {
        let loader = loader.clone();
        tokio::spawn(async move { loader.replay(records).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(loader.is_running());
    assert!(matches!(
        loader.replay(Vec::new()).await,
        Err(PersistError::AlreadyRunning(_))
    ));

    h.engine.record_stored("S2").await;

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.spawned, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.materializer.spawned(), vec![plate("S1")]);
    assert!(!loader.is_running());
}

#[tokio::test]
async fn cancelled_replay_can_run_again() {
    let (h, _store) = harness(quick_config());
    for raw in ["C1", "C2"] {
        h.engine.record_parked("char:c", vehicle(raw, "x")).await;
    }
    let records = h.engine.list_all().await;

    let loader = ReplayLoader::new(
        h.materializer.clone(),
        h.engine.registry().clone(),
        h.engine.gateway().publisher().clone(),
        Duration::from_millis(500),
    );
    let first = tokio::time::timeout(Duration::from_millis(50), loader.replay(records.clone())).await;
    assert!(first.is_err());
    assert!(!loader.is_running());

    let report = tokio::time::timeout(Duration::from_secs(5), loader.replay(vec![records[0].clone()]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.spawned, 1);
}

#[tokio::test]
async fn owner_disconnect_parks_driven_vehicles() {
    let live = LiveProperties {
        position: Vec3::new(5.0, 5.0, 5.0),
        heading: 90.0,
        configuration: None,
        condition: None,
    };
    let h = harness_with(
        EngineConfig::new().max_vehicles_per_player(2),
        Arc::new(vehicle_persist::MemoryStore::new()),
        Some(Arc::new(FixedLive(live))),
    );

    h.engine.record_parked("char:dc", vehicle("P1", "x")).await;
    h.engine.record_parked("char:dc", vehicle("P2", "x")).await;
    h.engine
        .record_parked("char:dc", vehicle("DRV1", "x").in_use(true))
        .await;
    h.engine.bind_handle("DRV1", WorldHandle(11)).await;
    assert_eq!(h.engine.list_all().await.len(), 3);

    assert_eq!(h.engine.owner_disconnected("char:dc").await, 1);

    let driven = h.engine.get("DRV1").await.unwrap();
    assert!(!driven.being_used);
    // Parking the third vehicle pushes out the oldest.
    assert_eq!(h.engine.list_all().await.len(), 2);
    assert_eq!(h.engine.stats().await.evictions_total, 1);

    let mut refreshed = false;
    for _ in 0..50 {
        if h.engine.get("DRV1").await.unwrap().position == Vec3::new(5.0, 5.0, 5.0) {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed);
}

#[tokio::test]
async fn set_being_used_round_trip() {
    let (h, _store) = harness(quick_config());
    h.engine.record_parked("char:u", vehicle("USE1", "x")).await;
    assert!(h.engine.set_being_used("USE1", true).await);
    assert!(h.engine.get("USE1").await.unwrap().being_used);
    assert!(h.engine.set_being_used("USE1", false).await);
    assert!(!h.engine.get("USE1").await.unwrap().being_used);
    assert!(!h.engine.set_being_used("NOPE1", true).await);
}

#[tokio::test]
async fn background_flush_reaches_store() {
    let (h, store) = harness(quick_config().write_flush_interval(Duration::from_millis(20)));
    h.engine.start().await.unwrap();
    h.engine.record_parked("char:bg", vehicle("BG1", "x")).await;

    let mut stored = false;
    for _ in 0..50 {
        if store.get(&plate("BG1")).await.is_some() {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stored);

    let stats = h.engine.stats().await;
    assert_eq!(stats.tracked, 1);
    assert_eq!(stats.pending_writes, 0);
    assert!(stats.writes_total >= 1);
    h.engine.shutdown().await.unwrap();
}
