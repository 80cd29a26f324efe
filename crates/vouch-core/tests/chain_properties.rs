//! Cross-module ledger properties exercised through the public API:
//! chain integrity, tamper detection, rotation continuity, and canonical
//! determinism, all against a file-backed store.

use serde_json::json;
use tempfile::TempDir;
use vouch_core::canonical::to_canonical_string;
use vouch_core::event::{Event, EventType, HASH_SIZE};
use vouch_core::verify::VerifyFailure;
use vouch_core::worker::{LedgerWorker, WorkerConfig};
use vouch_core::{verify_run, Signer, Store};

struct Harness {
    store: Store,
    run_id: String,
    key_dir: TempDir,
    _db_dir: TempDir,
    db_path: std::path::PathBuf,
}

async fn build_chain(events: usize) -> Harness {
    let key_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let db_path = db_dir.path().join("vouch.db");

    let store = Store::open(&db_path).unwrap();
    let signer = Signer::load_or_generate(key_dir.path().join(".vouch_key")).unwrap();
    let worker = LedgerWorker::start(store.clone(), signer, WorkerConfig::default()).unwrap();
    let run_id = worker.run_id().to_string();

    for i in 0..events {
        worker
            .submit(
                Event::new(EventType::ToolCall)
                    .with_method("fs.read")
                    .with_params(json!({ "path": format!("/tmp/{i}"), "task_id": "T1" })),
            )
            .unwrap();
    }
    worker.shutdown().await;

    Harness {
        store,
        run_id,
        key_dir,
        _db_dir: db_dir,
        db_path,
    }
}

#[tokio::test]
async fn chain_is_dense_linked_and_signed() {
    let h = build_chain(25).await;
    let events = h.store.range(&h.run_id, 0, 1_000, 1_000).unwrap();
    assert_eq!(events.len(), 26);

    let ranges = h.store.key_ranges(&h.run_id).unwrap();
    let mut prev_hash = vec![0u8; HASH_SIZE];
    for (i, event) in events.iter().enumerate() {
        // Dense sequence from zero.
        assert_eq!(event.seq, i as u64);
        // Hash is a pure function of the content.
        assert_eq!(event.hash, event.compute_hash().unwrap());
        // Back-link to the predecessor.
        assert_eq!(event.prev_hash, prev_hash);
        // Signature under the covering key.
        let range = ranges.iter().find(|r| r.covers(event.seq)).unwrap();
        let key = hex::decode(&range.public_key).unwrap();
        assert!(Signer::verify(&key, &event.hash, &event.sig));
        prev_hash = event.hash.clone();
    }

    let report = verify_run(&h.store, &h.run_id).unwrap();
    assert!(report.valid);
    assert_eq!(report.total_events, 26);
}

#[tokio::test]
async fn every_tampered_field_is_detected_at_its_seq() {
    let h = build_chain(30).await;
    let original = h.store.range(&h.run_id, 0, 1_000, 1_000).unwrap();
    let ranges = h.store.key_ranges(&h.run_id).unwrap();

    let tamper_at = 13u64;
    let cases: Vec<(Box<dyn Fn(&mut Event)>, VerifyFailure)> = vec![
        (
            Box::new(|e: &mut Event| e.params = json!({"path": "/etc/shadow"})),
            VerifyFailure::Hash,
        ),
        (
            Box::new(|e: &mut Event| e.method = "fs.write".to_string()),
            VerifyFailure::Hash,
        ),
        (
            Box::new(|e: &mut Event| e.hash[0] ^= 0x01),
            VerifyFailure::Hash,
        ),
        (
            Box::new(|e: &mut Event| e.sig[63] ^= 0x80),
            VerifyFailure::Signature,
        ),
    ];

    for (tamper, expected_reason) in cases {
        let copy = Store::in_memory().unwrap();
        for event in &original {
            let mut event = event.clone();
            if event.seq == tamper_at {
                tamper(&mut event);
            }
            copy.append_event(&event).unwrap();
        }
        for range in &ranges {
            copy.append_key_range(&h.run_id, range.seq_first, &range.public_key)
                .unwrap();
        }

        let report = verify_run(&copy, &h.run_id).unwrap();
        assert!(!report.valid);
        assert_eq!(report.failed_at_seq, Some(tamper_at));
        assert_eq!(report.reason, Some(expected_reason));
    }
}

#[tokio::test]
async fn restart_continues_the_same_chain() {
    let h = build_chain(5).await;

    // Second process lifetime over the same store and key file.
    let store = Store::open(&h.db_path).unwrap();
    let signer = Signer::load_or_generate(h.key_dir.path().join(".vouch_key")).unwrap();
    let worker = LedgerWorker::start(store.clone(), signer, WorkerConfig::default()).unwrap();
    assert_eq!(worker.run_id(), h.run_id);

    for _ in 0..5 {
        worker
            .submit(Event::new(EventType::ToolCall).with_method("net.fetch"))
            .unwrap();
    }
    worker.rotate_key().await.unwrap();
    worker.shutdown().await;

    let report = verify_run(&store, &h.run_id).unwrap();
    assert!(report.valid, "{report:?}");
    assert_eq!(report.total_events, 12);
}

#[tokio::test]
async fn key_ranges_partition_the_chain_exactly() {
    let key_dir = TempDir::new().unwrap();
    let store = Store::in_memory().unwrap();
    let signer = Signer::load_or_generate(key_dir.path().join("k")).unwrap();
    let worker = LedgerWorker::start(store.clone(), signer, WorkerConfig::default()).unwrap();
    let run_id = worker.run_id().to_string();

    for _ in 0..3 {
        worker
            .submit(Event::new(EventType::ToolCall).with_method("a.b"))
            .unwrap();
        worker.rotate_key().await.unwrap();
    }
    worker.shutdown().await;

    let last_seq = store.last_event(&run_id).unwrap().unwrap().seq;
    let ranges = store.key_ranges(&run_id).unwrap();

    // Contiguous, non-overlapping, covering [0, last_seq]; the trailing
    // rekey leaves the open range starting just past the head.
    assert_eq!(ranges[0].seq_first, 0);
    for pair in ranges.windows(2) {
        assert_eq!(pair[0].seq_last, Some(pair[1].seq_first - 1));
    }
    assert_eq!(ranges.last().unwrap().seq_first, last_seq + 1);
    for seq in 0..=last_seq {
        assert_eq!(ranges.iter().filter(|r| r.covers(seq)).count(), 1);
    }

    assert!(verify_run(&store, &run_id).unwrap().valid);
}

#[test]
fn canonicalization_is_deterministic_for_event_content() {
    let a = json!({
        "params": { "z": [1, 2.5, {"b": null, "a": "x"}], "a": true },
        "ts": 1_700_000_000_123_i64,
        "method": "fs.read",
    });
    let b = json!({
        "method": "fs.read",
        "ts": 1_700_000_000_123_i64,
        "params": { "a": true, "z": [1, 2.5, {"a": "x", "b": null}] },
    });
    let ca = to_canonical_string(&a).unwrap();
    let cb = to_canonical_string(&b).unwrap();
    assert_eq!(ca, cb);
    assert_eq!(
        ca,
        r#"{"method":"fs.read","params":{"a":true,"z":[1,2.5,{"a":"x","b":null}]},"ts":1700000000123}"#
    );
}
