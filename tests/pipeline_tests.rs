//! End-to-end scenarios: positions in, persisted delay events out.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use tram_delay_tracker::config::TrackerConfig;
use tram_delay_tracker::fetch::FeedSource;
use tram_delay_tracker::model::{Classification, VehiclePosition};
use tram_delay_tracker::parser::RawPosition;
use tram_delay_tracker::spatial::{SpatialIndex, StaticSpatialIndex};
use tram_delay_tracker::store::{EventStore, MemoryEventStore};
use tram_delay_tracker::tracker::dispatcher::Dispatcher;
use tram_delay_tracker::tracker::registry::WorkerRegistry;
use tram_delay_tracker::tracker::worker::{VehicleWorker, WorkerMsg};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap()
}

fn pos(vehicle_id: &str, lat: f64, lon: f64, secs: i64) -> VehiclePosition {
    VehiclePosition {
        vehicle_id: vehicle_id.to_string(),
        line: "17".to_string(),
        lat,
        lon,
        observed_at: t0() + Duration::seconds(secs),
    }
}

fn spawn(
    vehicle_id: &str,
    store: Arc<MemoryEventStore>,
    spatial: Arc<dyn SpatialIndex>,
) -> mpsc::Sender<WorkerMsg> {
    VehicleWorker::spawn(
        vehicle_id.to_string(),
        Arc::new(TrackerConfig::default()),
        store,
        spatial,
    )
}

async fn send_positions(tx: &mpsc::Sender<WorkerMsg>, positions: Vec<VehiclePosition>) {
    for p in positions {
        tx.send(WorkerMsg::Position(p)).await.unwrap();
    }
}

async fn finish(tx: mpsc::Sender<WorkerMsg>) {
    tx.send(WorkerMsg::Shutdown).await.unwrap();
    tx.closed().await;
}

async fn all_events(store: &MemoryEventStore) -> Vec<tram_delay_tracker::model::DelayEvent> {
    store
        .query_range(t0() - Duration::hours(1), t0() + Duration::hours(1))
        .await
        .unwrap()
}

/// Vehicle V1 stops away from any platform for 150 s: one delay event,
/// multi-cycle, duration about 150 s.
#[tokio::test(start_paused = true)]
async fn roadside_stop_persists_as_multi_cycle_delay() {
    let store = Arc::new(MemoryEventStore::new());
    let tx = spawn("v1", store.clone(), Arc::new(StaticSpatialIndex::empty()));

    let mut positions = vec![pos("v1", 52.2300, 21.0100, 0)];
    // Stopped at the same point from t=10 through t=150.
    for secs in (10..=150).step_by(10) {
        positions.push(pos("v1", 52.2300, 21.0100, secs));
    }
    // Resumes movement at t=160; the first stopped decision was at t=10.
    positions.push(pos("v1", 52.2340, 21.0100, 160));
    send_positions(&tx, positions).await;

    // Grace window expires with no re-stop.
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    finish(tx).await;

    let events = all_events(&store).await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.classification, Classification::Delay);
    assert!(!event.at_stop);
    assert_eq!(event.duration_seconds, Some(150));
    assert!(event.multi_cycle);
    assert_eq!(event.resolved_at, Some(t0() + Duration::seconds(160)));
}

/// Vehicle V2 dwells 90 s at a platform: normal boarding, nothing persisted.
#[tokio::test(start_paused = true)]
async fn platform_dwell_is_never_persisted() {
    let store = Arc::new(MemoryEventStore::new());
    // The platform sits exactly where the vehicle stops.
    let spatial = Arc::new(StaticSpatialIndex::new(
        vec![(52.2300, 21.0100)],
        vec![],
        50.0,
        50.0,
    ));
    let tx = spawn("v2", store.clone(), spatial);

    let mut positions = vec![pos("v2", 52.2300, 21.0100, 0)];
    for secs in (10..=110).step_by(10) {
        positions.push(pos("v2", 52.2300, 21.0100, secs));
    }
    positions.push(pos("v2", 52.2340, 21.0100, 120));
    send_positions(&tx, positions).await;

    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    finish(tx).await;

    assert!(all_events(&store).await.is_empty());
    assert_eq!(store.unresolved_count().await.unwrap(), 0);
}

/// Vehicle V3 stops, creeps 30 m forward, and stops again within the grace
/// window: one event spanning both stops, not two.
#[tokio::test(start_paused = true)]
async fn double_stop_merges_into_one_event() {
    let store = Arc::new(MemoryEventStore::new());
    let tx = spawn("v3", store.clone(), Arc::new(StaticSpatialIndex::empty()));

    let mut positions = vec![pos("v3", 52.23000, 21.0100, 0)];
    // First stop: t=10 through t=60.
    for secs in (10..=60).step_by(10) {
        positions.push(pos("v3", 52.23000, 21.0100, secs));
    }
    // Creeps ~30 m in 10 s (about 11 km/h), then holds there.
    positions.push(pos("v3", 52.23027, 21.0100, 70));
    for secs in (80..=120).step_by(10) {
        positions.push(pos("v3", 52.23027, 21.0100, secs));
    }
    // Clears the blockage for good at t=130.
    positions.push(pos("v3", 52.23250, 21.0100, 130));
    send_positions(&tx, positions).await;

    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    finish(tx).await;

    let events = all_events(&store).await;
    assert_eq!(events.len(), 1, "both stops must fold into one event");
    let event = &events[0];
    // Started at the first stop decision, resolved at the final resumption.
    assert_eq!(event.started_at, t0() + Duration::seconds(10));
    assert_eq!(event.resolved_at, Some(t0() + Duration::seconds(130)));
    assert_eq!(event.duration_seconds, Some(120));
}

/// Two stops 100 m apart are independent: the first resolves on its own and
/// only the second persists if it lasts long enough.
#[tokio::test(start_paused = true)]
async fn distant_restop_produces_two_independent_events() {
    let store = Arc::new(MemoryEventStore::new());
    let tx = spawn("v4", store.clone(), Arc::new(StaticSpatialIndex::empty()));

    let mut positions = vec![pos("v4", 52.23000, 21.0100, 0)];
    for secs in (10..=60).step_by(10) {
        positions.push(pos("v4", 52.23000, 21.0100, secs));
    }
    // ~100 m away 10 s later, then stopped there for 50 s.
    positions.push(pos("v4", 52.23090, 21.0100, 70));
    for secs in (80..=130).step_by(10) {
        positions.push(pos("v4", 52.23090, 21.0100, secs));
    }
    positions.push(pos("v4", 52.23300, 21.0100, 140));
    send_positions(&tx, positions).await;

    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    finish(tx).await;

    let events = all_events(&store).await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.is_resolved()));
}

/// Eviction resolves and persists an in-flight delay before the worker dies.
#[tokio::test(start_paused = true)]
async fn eviction_flushes_open_delay() {
    let store = Arc::new(MemoryEventStore::new());
    let tx = spawn("v5", store.clone(), Arc::new(StaticSpatialIndex::empty()));

    let mut positions = vec![pos("v5", 52.2300, 21.0100, 0)];
    for secs in (10..=50).step_by(10) {
        positions.push(pos("v5", 52.2300, 21.0100, secs));
    }
    send_positions(&tx, positions).await;

    // No movement ever observed; the lifecycle sweep shuts the worker down.
    finish(tx).await;

    let events = all_events(&store).await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(event.is_resolved());
    assert_eq!(event.classification, Classification::Delay);
    // Resolved at the last evidence of the vehicle.
    assert_eq!(event.resolved_at, Some(t0() + Duration::seconds(50)));
}

/// Full path: raw snapshot records through the dispatcher to a persisted
/// event, including free-form coordinate parsing and line filtering.
#[tokio::test(start_paused = true)]
async fn dispatcher_to_store_round_trip() {
    struct ScriptedFeed {
        snapshots: Mutex<Vec<Vec<RawPosition>>>,
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn snapshot(&self) -> anyhow::Result<Vec<RawPosition>> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(snapshots.remove(0))
            }
        }
    }

    fn raw(vehicle_id: &str, line: &str, lat: &str, secs: i64) -> RawPosition {
        RawPosition {
            vehicle_id: vehicle_id.to_string(),
            line: line.to_string(),
            lat: lat.to_string(),
            lon: "21.0100".to_string(),
            observed_at: t0() + Duration::seconds(secs),
        }
    }

    // Tram 1000 sits still for 40 s then moves; bus 9000 tags along and must
    // be ignored throughout.
    let mut snapshots = vec![vec![
        raw("1000", "17", " 52.2300 ", 0),
        raw("9000", "190", "52.2400", 0),
    ]];
    for (i, secs) in (10..=50).step_by(10).enumerate() {
        snapshots.push(vec![
            raw("1000", "17", " 52.2300 ", secs),
            raw("9000", "190", "52.2400", 10 * i as i64),
        ]);
    }
    snapshots.push(vec![raw("1000", "17", "52.2340", 60)]);

    let store = Arc::new(MemoryEventStore::new());
    let dispatcher = Dispatcher::new(
        Arc::new(TrackerConfig::default()),
        ScriptedFeed {
            snapshots: Mutex::new(snapshots),
        },
        Arc::new(WorkerRegistry::new()),
        store.clone(),
        Arc::new(StaticSpatialIndex::empty()),
    );

    for _ in 0..7 {
        dispatcher.cycle().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    dispatcher.shutdown().await;

    let events = all_events(&store).await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.vehicle_id, "1000");
    assert_eq!(event.line, "17");
    assert_eq!(event.classification, Classification::Delay);
    assert!(event.is_resolved());
}
