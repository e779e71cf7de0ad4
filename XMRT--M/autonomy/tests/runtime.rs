use std::{collections::HashMap, time::Duration};

use tempfile::tempdir;
use xmrt_autonomy::{
    AutonomyRuntime, ComponentStatus, CoordinatorConfig, CycleOutcome, Lifecycle, StoreBackend,
};

const DOCUMENT: &str = r#"
[engine]
reflection_budget = 2
call_timeout_ms = 1000

[feeds]
simulate = true
identities = ["worker_001", "worker_002", "worker_003"]
[feeds.mesh_mapping]
worker_001 = "mesh_001"
worker_002 = "mesh_002"

[[components]]
id = "leaderboard-agent"
cycle_interval_seconds = 10
[[components.actions]]
kind = "refresh_leaderboard"
[[components.actions]]
kind = "consolidate_memory"

[[components]]
id = "treasury-agent"
cycle_interval_seconds = 30
[[components.actions]]
kind = "allocate_treasury"
"#;

fn config(dir: &std::path::Path) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::from_toml_str(DOCUMENT).unwrap();
    config.store.backend = StoreBackend::File;
    config.store.path = dir.join("state");
    config
}

#[tokio::test(start_paused = true)]
async fn runtime_cycles_publish_leaderboard_and_allocation() {
    let dir = tempdir().unwrap();
    let runtime = AutonomyRuntime::builder(config(dir.path())).build().await.unwrap();
    let started = runtime.start_all().unwrap();
    assert_eq!(started, vec!["leaderboard-agent", "treasury-agent"]);

    tokio::time::sleep(Duration::from_secs(25)).await;

    let leaderboard = runtime.leaderboard().await.unwrap();
    let ranks: Vec<usize> = leaderboard.entries.iter().map(|e| e.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert_eq!(leaderboard.entries[0].identity, "worker_001");

    let allocation = runtime.allocation().await.unwrap();
    allocation.verify().unwrap();
    assert!((allocation.treasury_ratio - 0.85).abs() < f64::EPSILON);

    let status = runtime.status();
    assert!(status.iter().all(|s| s.running && s.lifecycle == Lifecycle::Running));
    assert!(status.iter().all(|s| s.last_outcome == Some(CycleOutcome::Success)));

    let events = runtime.events();
    assert!(!events.events_of("autonomy.cycle.completed").is_empty());
    assert!(!events.events_of("treasury.allocation.computed").is_empty());

    runtime.shutdown().await;
    assert!(runtime.status().iter().all(|s| !s.running));
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_cycle_ids_and_history() {
    let dir = tempdir().unwrap();
    let last = {
        let runtime = AutonomyRuntime::builder(config(dir.path())).build().await.unwrap();
        runtime.start("leaderboard-agent").unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        runtime.shutdown().await;
        let history = runtime.history("leaderboard-agent", 16).await.unwrap();
        history.last().unwrap().cycle_id
    };
    assert_eq!(last, 3);

    let runtime = AutonomyRuntime::builder(config(dir.path())).build().await.unwrap();
    let persisted = runtime.history("leaderboard-agent", 16).await.unwrap();
    assert_eq!(
        persisted.iter().map(|r| r.cycle_id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(runtime.leaderboard().await.is_some());

    let status: HashMap<String, ComponentStatus> =
        runtime.status().into_iter().map(|s| (s.id.clone(), s)).collect();
    let restored = &status["leaderboard-agent"];
    assert_eq!(restored.last_cycle_id, Some(3));
    assert_eq!(restored.last_outcome, persisted.last().map(|r| r.outcome));
    assert!(!restored.running);
    assert_eq!(status["treasury-agent"].last_cycle_id, None);

    runtime.start("leaderboard-agent").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resumed = runtime.history("leaderboard-agent", 1).await.unwrap();
    assert_eq!(resumed[0].cycle_id, 4);
    runtime.shutdown().await;
}
