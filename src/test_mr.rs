use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::mr::artifact::collect_outputs;
use crate::mr::store::{CsvStore, MemStore};
use crate::mr::{
    AppFuture, Engine, EngineConfig, EngineState, Error, InputMode, KeyValue, MRApp, MapInput, OnConflict, Params,
    Phase,
};
use crate::mrapps::wc::WC;
use crate::mrrt::sequential;
use crate::storage::{FsStorage, MemStorage, Storage};

const SCENARIO: &[&str] = &["a b a", "b c", "a c c"];

fn expected(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn config(root: &Path, mode: InputMode) -> EngineConfig {
    EngineConfig {
        input_mode: mode,
        max_workers: 2,
        ..EngineConfig::rooted(root)
    }
}

fn dir_entries(path: &Path) -> usize {
    std::fs::read_dir(path).map(|d| d.count()).unwrap_or(0)
}

/// Word count whose map sleeps on inputs containing "slow", fails on
/// inputs containing "boom" and panics on inputs containing "panic".
struct Faulty {
    reduced: Arc<AtomicBool>,
}

impl MRApp for Faulty {
    fn map(&self, input: MapInput, params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        Box::pin(async move {
            let text: String = input.contents().await?.into_iter().map(|(_, t)| t).collect();
            if text.contains("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if text.contains("boom") {
                anyhow::bail!("cannot map {:?}", input.unit());
            }
            if text.contains("panic") {
                panic!("map blew up");
            }
            WC.map(input, params).await
        })
    }

    fn reduce(&self, key: String, values: Vec<String>, params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        self.reduced.store(true, Ordering::SeqCst);
        WC.reduce(key, values, params)
    }
}

fn faulty() -> (Arc<dyn MRApp>, Arc<AtomicBool>) {
    let reduced = Arc::new(AtomicBool::new(false));
    (Arc::new(Faulty { reduced: reduced.clone() }), reduced)
}

#[tokio::test]
async fn word_count_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, ids) = MemStorage::with_inputs(SCENARIO);
    let mut engine = Engine::new(config(dir.path(), InputMode::Single), Arc::new(WC), Arc::new(storage));

    let report = engine.execute(ids).await.unwrap();

    assert_eq!(report.map_tasks, 3);
    assert_eq!(report.groups, 3);
    assert_eq!(report.outputs.len(), 3);
    assert_eq!(report.outputs[0], dir.path().join("output/part-0-final.csv"));
    let out = collect_outputs(&report.outputs).await.unwrap();
    assert_eq!(out, expected(&[("a", "3"), ("b", "2"), ("c", "3")]));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn empty_input_runs_no_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(
        config(dir.path(), InputMode::Batch),
        Arc::new(WC),
        Arc::new(MemStorage::new()),
    );

    let report = engine.execute(vec![]).await.unwrap();

    assert_eq!((report.map_tasks, report.groups), (0, 0));
    assert!(report.outputs.is_empty());
    assert!(!dir.path().join("mr.store").exists());
    assert!(!dir.path().join("mapreducetemp").exists());
    engine.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_mode_agrees_with_sequential_run() {
    let texts = ["the cat", "the dog sat", "a cat sat on the mat", "dog", "the end the"];
    let (storage, ids) = MemStorage::with_inputs(texts);
    let storage: Arc<dyn Storage> = Arc::new(storage);

    let reference: BTreeMap<_, _> = sequential::run(&WC, storage.clone(), ids.clone(), Arc::default())
        .await
        .unwrap()
        .into_iter()
        .map(|kv| (kv.key, kv.value))
        .collect();

    for mode in [InputMode::Single, InputMode::Batch, InputMode::Appender] {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            chunk_size: 20,
            ..config(dir.path(), mode)
        };
        let mut engine = Engine::new(config, Arc::new(WC), storage.clone());

        let report = engine.execute(ids.clone()).await.unwrap();

        let out = collect_outputs(&report.outputs).await.unwrap();
        assert_eq!(out, reference, "{:?} mode", mode);
        assert_eq!(report.groups, reference.len());
        if mode != InputMode::Single {
            assert!(report.map_tasks < texts.len(), "{:?} mode should batch", mode);
        }
    }
}

#[tokio::test]
async fn batch_mode_maps_one_task_per_batch() {
    let dir = tempfile::tempdir().unwrap();
    // sizes 5, 3, 5 with a threshold of 8: [file_0, file_1], [file_2]
    let (storage, ids) = MemStorage::with_inputs(SCENARIO);
    let config = EngineConfig {
        chunk_size: 8,
        ..config(dir.path(), InputMode::Batch)
    };
    let mut engine = Engine::new(config, Arc::new(WC), Arc::new(storage));

    let report = engine.execute(ids).await.unwrap();

    assert_eq!(report.map_tasks, 2);
    let out = collect_outputs(&report.outputs).await.unwrap();
    assert_eq!(out, expected(&[("a", "3"), ("b", "2"), ("c", "3")]));
}

#[tokio::test]
async fn appender_blobs_are_removed_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, ids) = MemStorage::with_inputs(SCENARIO);
    let config = EngineConfig {
        chunk_size: 8,
        ..config(dir.path(), InputMode::Appender)
    };
    let mut engine = Engine::new(config, Arc::new(WC), Arc::new(storage.clone()));

    let report = engine.execute(ids.clone()).await.unwrap();

    assert_eq!(report.map_tasks, 2);
    assert_eq!(storage.ids(), ids);
    let out = collect_outputs(&report.outputs).await.unwrap();
    assert_eq!(out, expected(&[("a", "3"), ("b", "2"), ("c", "3")]));
}

#[tokio::test]
async fn runs_against_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    let mut ids = vec![];
    for (i, text) in SCENARIO.iter().enumerate() {
        let id = format!("file_{}", i);
        storage.write(&id, text.as_bytes()).await.unwrap();
        ids.push(id);
    }
    let config = EngineConfig {
        chunk_size: 8,
        ..config(dir.path(), InputMode::Appender)
    };
    let mut engine = Engine::new(config, Arc::new(WC), Arc::new(storage));

    let report = engine.execute(ids).await.unwrap();

    let out = collect_outputs(&report.outputs).await.unwrap();
    assert_eq!(out, expected(&[("a", "3"), ("b", "2"), ("c", "3")]));
    let mut left: Vec<_> = std::fs::read_dir(dir.path().join("files"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    left.sort();
    assert_eq!(left, vec!["file_0_data.txt", "file_1_data.txt", "file_2_data.txt"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shuffle_waits_for_slow_map_task() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, ids) = MemStorage::with_inputs(["x y", "slow x", "y"]);
    let (app, _) = faulty();
    let mut engine = Engine::with_store(
        config(dir.path(), InputMode::Single),
        app,
        Arc::new(storage),
        MemStore::new(OnConflict::Fail),
    );

    let report = engine.execute(ids).await.unwrap();

    let out = collect_outputs(&report.outputs).await.unwrap();
    assert_eq!(out, expected(&[("slow", "1"), ("x", "2"), ("y", "2")]));
    assert!(!engine.store().is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn map_failures_are_reported_after_all_siblings_finish() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, ids) = MemStorage::with_inputs(["ok", "boom", "slow ok", "panic", "boom again"]);
    let (app, reduced) = faulty();
    let mut engine = Engine::new(config(dir.path(), InputMode::Single), app, Arc::new(storage));

    let err = engine.execute(ids).await.unwrap_err();

    match &err {
        Error::PhaseFailed { phase, failures } => {
            assert_eq!(*phase, Phase::Map);
            assert!(failures[0].cause.contains("cannot map"));
            assert!(failures[1].cause.contains("map blew up"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.failed_task_ids(), vec![1, 3, 4]);
    assert!(!reduced.load(Ordering::SeqCst));
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(!dir.path().join("mr.store").exists());
    assert_eq!(dir_entries(&dir.path().join("mapreducetemp")), 0);
    assert_eq!(dir_entries(&dir.path().join("output")), 0);
}

#[tokio::test]
async fn reduce_failures_name_the_group_task() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, ids) = MemStorage::with_inputs(["a b", "b"]);

    struct BadCount;
    impl MRApp for BadCount {
        fn map(&self, input: MapInput, _params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
            Box::pin(async move {
                let mut out = vec![];
                for (_, text) in input.contents().await? {
                    for word in text.split_whitespace() {
                        let count = if word == "b" { "x" } else { "1" };
                        out.push(KeyValue::new(word, count));
                    }
                }
                Ok(out)
            })
        }

        fn reduce(&self, key: String, values: Vec<String>, params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
            WC.reduce(key, values, params)
        }
    }

    let mut engine = Engine::new(config(dir.path(), InputMode::Single), Arc::new(BadCount), Arc::new(storage));
    let err = engine.execute(ids).await.unwrap_err();

    match &err {
        Error::PhaseFailed { phase, failures } => {
            assert_eq!(*phase, Phase::Reduce);
            assert_eq!(failures.len(), 1);
            // groups are a, b: "b" is reduce task 1
            assert_eq!(failures[0].task_id, 1);
        }
        other => panic!("unexpected error: {}", other),
    }
    // successful reduce outputs are final and survive cleanup
    assert!(dir.path().join("output/part-0-final.csv").exists());
    assert!(!dir.path().join("mr.store").exists());
}

#[tokio::test]
async fn stale_store_aborts_before_any_task() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("mr.store");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("temp_results.csv"), "key,value\nold,1\n").unwrap();
    let (storage, ids) = MemStorage::with_inputs(SCENARIO);
    let (app, reduced) = faulty();
    let mut engine = Engine::new(config(dir.path(), InputMode::Single), app, Arc::new(storage));

    let err = engine.execute(ids).await.unwrap_err();

    assert!(matches!(err, Error::StoreInitConflict(_)), "{}", err);
    assert!(stale.join("temp_results.csv").exists());
    assert!(!reduced.load(Ordering::SeqCst));
    assert_eq!(dir_entries(&dir.path().join("mapreducetemp")), 0);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn reset_policy_replaces_stale_store() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("mr.store");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("temp_results.csv"), "key,value\nold,1\n").unwrap();
    let (storage, ids) = MemStorage::with_inputs(SCENARIO);
    let config = EngineConfig {
        on_conflict: OnConflict::Reset,
        ..config(dir.path(), InputMode::Single)
    };
    let mut engine = Engine::new(config, Arc::new(WC), Arc::new(storage));

    let report = engine.execute(ids).await.unwrap();

    let out = collect_outputs(&report.outputs).await.unwrap();
    assert!(!out.contains_key("old"));
    assert!(!stale.exists());
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, ids) = MemStorage::with_inputs(SCENARIO);
    let mut engine = Engine::new(config(dir.path(), InputMode::Single), Arc::new(WC), Arc::new(storage));

    engine.execute(ids.clone()).await.unwrap();
    engine.cleanup().await.unwrap();
    engine.cleanup().await.unwrap();

    assert!(!dir.path().join("mr.store").exists());
    assert!(!dir.path().join("mapreducetemp").exists());
    assert_eq!(dir_entries(&dir.path().join("output")), 3);

    // the same engine can run again once idle
    let report = engine.execute(ids).await.unwrap();
    assert_eq!(report.groups, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_runs_give_identical_results() {
    let texts: Vec<String> = (0..40)
        .map(|i| (0..(i % 7 + 1)).map(|j| format!("w{} ", (i * j) % 11)).collect())
        .collect();
    let (storage, ids) = MemStorage::with_inputs(&texts);
    let storage: Arc<dyn Storage> = Arc::new(storage);

    let mut results = vec![];
    for workers in [1, 3, 16] {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            max_workers: workers,
            ..config(dir.path(), InputMode::Single)
        };
        let mut engine = Engine::new(config, Arc::new(WC), storage.clone());
        let report = engine.execute(ids.clone()).await.unwrap();
        results.push(collect_outputs(&report.outputs).await.unwrap());
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
    let total: u64 = results[0].values().map(|v| v.parse::<u64>().unwrap()).sum();
    assert_eq!(total, texts.iter().map(|t| t.split_whitespace().count() as u64).sum::<u64>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_engines_run_side_by_side() {
    let (storage, ids) = MemStorage::with_inputs(SCENARIO);
    let storage: Arc<dyn Storage> = Arc::new(storage);
    let left = tempfile::tempdir().unwrap();
    let right = tempfile::tempdir().unwrap();
    let mut a = Engine::new(config(left.path(), InputMode::Single), Arc::new(WC), storage.clone());
    let mut b = Engine::with_store(
        config(right.path(), InputMode::Batch),
        Arc::new(WC),
        storage.clone(),
        CsvStore::new(right.path().join("other.store"), OnConflict::Fail),
    );

    let (ra, rb) = tokio::join!(a.execute(ids.clone()), b.execute(ids.clone()));

    let oa = collect_outputs(&ra.unwrap().outputs).await.unwrap();
    let ob = collect_outputs(&rb.unwrap().outputs).await.unwrap();
    assert_eq!(oa, ob);
}

/// Word count that sleeps before mapping so concurrent runs overlap.
struct Sluggish;

impl MRApp for Sluggish {
    fn map(&self, input: MapInput, params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            WC.map(input, params).await
        })
    }

    fn reduce(&self, key: String, values: Vec<String>, params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        WC.reduce(key, values, params)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn appender_runs_sharing_storage_and_staging_stay_apart() {
    let mem = MemStorage::new();
    let mut left_ids = vec![];
    let mut right_ids = vec![];
    for i in 0..4 {
        let (l, r) = (format!("l{}", i), format!("r{}", i));
        mem.write(&l, b"left left").await.unwrap();
        mem.write(&r, b"right").await.unwrap();
        left_ids.push(l);
        right_ids.push(r);
    }
    let storage: Arc<dyn Storage> = Arc::new(mem.clone());
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("shared-staging");
    let engine = |name: &str| {
        let config = EngineConfig {
            chunk_size: 12,
            staging_dir: staging.clone(),
            ..config(&dir.path().join(name), InputMode::Appender)
        };
        Engine::new(config, Arc::new(Sluggish), storage.clone())
    };
    let (mut left, mut right) = (engine("left"), engine("right"));

    let (rl, rr) = tokio::join!(left.execute(left_ids.clone()), right.execute(right_ids.clone()));

    let ol = collect_outputs(&rl.unwrap().outputs).await.unwrap();
    let or = collect_outputs(&rr.unwrap().outputs).await.unwrap();
    assert_eq!(ol, expected(&[("left", "8")]));
    assert_eq!(or, expected(&[("right", "4")]));
    let mut remaining = left_ids;
    remaining.extend(right_ids);
    remaining.sort();
    assert_eq!(mem.ids(), remaining);
    assert!(!staging.exists());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_setup() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        max_workers: 0,
        ..config(dir.path(), InputMode::Single)
    };
    let mut engine = Engine::new(config, Arc::new(WC), Arc::new(MemStorage::new()));

    let err = engine.execute(vec!["file_0".to_string()]).await.unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(!dir.path().join("mr.store").exists());
}

#[tokio::test]
async fn missing_input_fails_its_map_task() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, mut ids) = MemStorage::with_inputs(SCENARIO);
    ids.insert(1, "ghost".to_string());
    let mut engine = Engine::new(config(dir.path(), InputMode::Single), Arc::new(WC), Arc::new(storage));

    let err = engine.execute(ids).await.unwrap_err();

    assert_eq!(err.failed_task_ids(), vec![1]);
    assert!(err.to_string().contains("ghost"), "{}", err);
}

#[tokio::test]
async fn params_reach_map_functions() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, ids) = MemStorage::with_inputs(["A a", "B b a"]);
    let params = Params::from([("lowercase".to_string(), "true".to_string())]);
    let mut engine =
        Engine::new(config(dir.path(), InputMode::Single), Arc::new(WC), Arc::new(storage)).with_params(params);

    let report = engine.execute(ids).await.unwrap();

    let out = collect_outputs(&report.outputs).await.unwrap();
    assert_eq!(out, expected(&[("a", "3"), ("b", "2")]));
}
