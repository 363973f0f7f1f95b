//! Integration tests for the attendance repository
//!
//! Runs the repository against the in-memory remote store and a sled cache
//! in a temporary directory.

use chrono::NaiveDate;
use roster_sync::model::Fields;
use roster_sync::{
    ActivityType, AttendanceRecord, AttendanceRepository, Cadet, CadetId, Collection,
    InMemoryRemoteStore, LocalCache, RepositoryConfig, RosterError, RosterScope, Slot, Status,
    Weekday,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type Repo = AttendanceRepository<InMemoryRemoteStore>;

fn week() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 19).unwrap()
}

/// Helper to create a repository with a temporary cache directory
fn create_repo(max_age: Duration, store: InMemoryRemoteStore) -> (Arc<InMemoryRemoteStore>, Repo, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(LocalCache::at_path(temp_dir.path().join("cache.sled")).unwrap());
    let store = Arc::new(store);
    let config = RepositoryConfig {
        max_age,
        ..Default::default()
    };
    let repo = AttendanceRepository::new(Arc::clone(&store), cache, config);
    (store, repo, temp_dir)
}

async fn seed_cadet(store: &InMemoryRemoteStore, id: &str, last_name: &str, company: &str) {
    let cadet = Cadet {
        id: CadetId::from(id),
        first_name: format!("Cadet{}", id),
        last_name: last_name.to_string(),
        company: company.to_string(),
        class_year: Some(2027),
    };
    store.seed(Collection::Cadets, id, cadet.to_fields()).await;
}

async fn seed_record(store: &InMemoryRemoteStore, record: &AttendanceRecord) {
    store
        .seed(Collection::Attendance, &record.key(), record.to_fields())
        .await;
}

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().unwrap().clone()
}

fn ids(values: &[&str]) -> BTreeSet<CadetId> {
    values.iter().map(|v| CadetId::from(*v)).collect()
}

#[tokio::test]
async fn test_missing_records_are_synthesized() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    for (id, name) in [("1", "Adams"), ("2", "Baker"), ("3", "Clark")] {
        seed_cadet(&store, id, name, "Alpha").await;
    }
    let stored = AttendanceRecord::unset("2".into(), week()).with(Slot::PtMonday, Status::Present);
    seed_record(&store, &stored).await;

    let map = repo
        .get_scoped_attendance(&RosterScope::Company("Alpha".into()), week())
        .await
        .unwrap();

    assert_eq!(map.len(), 3);
    assert_eq!(map[&CadetId::from("2")], stored);
    assert!(map[&CadetId::from("1")].is_unset());
    assert!(map[&CadetId::from("3")].is_unset());
    assert_eq!(map[&CadetId::from("3")].week_start, week());
}

#[tokio::test]
async fn test_cadets_scoped_and_sorted() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    seed_cadet(&store, "1", "Young", "Alpha").await;
    seed_cadet(&store, "2", "Abbott", "Alpha").await;
    seed_cadet(&store, "3", "Moore", "Bravo").await;

    let alpha = repo
        .get_cadets(&RosterScope::Company("Alpha".into()))
        .await
        .unwrap();
    let names: Vec<&str> = alpha.iter().map(|c| c.last_name.as_str()).collect();
    assert_eq!(names, vec!["Abbott", "Young"]);

    let all = repo.get_cadets(&RosterScope::All).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_fresh_cache_served_then_refreshed_in_background() {
    let (store, repo, _temp) = create_repo(Duration::from_secs(60), InMemoryRemoteStore::new());
    store
        .seed(Collection::TrainingEvents, "e1", fields(json!({"name": "FTX"})))
        .await;

    let first = repo
        .read_scope(Collection::TrainingEvents, "all", vec![])
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(store.stats().queries, 1);

    store
        .seed(Collection::TrainingEvents, "e2", fields(json!({"name": "Range"})))
        .await;

    // Fresh: served from cache without waiting on the store.
    let second = repo
        .read_scope(Collection::TrainingEvents, "all", vec![])
        .await
        .unwrap();
    assert_eq!(second, first);

    // The background refresh eventually replaces the cached snapshot.
    let mut refreshed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cached = repo.cache().get(Collection::TrainingEvents, "all").unwrap();
        if cached.documents.len() == 2 {
            refreshed = true;
            break;
        }
    }
    assert!(refreshed, "background refresh never updated the cache");
    assert_eq!(store.stats().queries, 2);
}

#[tokio::test]
async fn test_stale_cache_fetches_synchronously() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    store
        .seed(Collection::PtPlans, "p1", fields(json!({"week": "2026-01-19"})))
        .await;

    repo.read_scope(Collection::PtPlans, "all", vec![]).await.unwrap();
    store
        .seed(Collection::PtPlans, "p2", fields(json!({"week": "2026-01-26"})))
        .await;

    let docs = repo.read_scope(Collection::PtPlans, "all", vec![]).await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(store.stats().queries, 2);
    assert_eq!(
        repo.cache().get(Collection::PtPlans, "all").unwrap().documents.len(),
        2
    );
}

#[tokio::test]
async fn test_single_slot_round_trip() {
    let (store, repo, _temp) = create_repo(Duration::from_secs(60), InMemoryRemoteStore::new());
    seed_cadet(&store, "42", "Baker", "Alpha").await;
    let scope = RosterScope::Company("Alpha".into());

    // Warm the week's cache so the write has something to invalidate.
    repo.get_scoped_attendance(&scope, week()).await.unwrap();

    repo.update_single_slot(
        &CadetId::from("42"),
        Weekday::Tuesday,
        Status::Excused,
        week(),
        ActivityType::Pt,
    )
    .await
    .unwrap();

    let map = repo.get_scoped_attendance(&scope, week()).await.unwrap();
    let record = &map[&CadetId::from("42")];
    for (slot, status) in record.slots() {
        let expected = if slot == Slot::PtTuesday {
            Status::Excused
        } else {
            Status::Unset
        };
        assert_eq!(status, expected, "slot {}", slot);
    }

    let doc = store
        .document(Collection::Attendance, "2026-01-19_42")
        .await
        .unwrap();
    assert_eq!(doc["ptTuesday"], json!("excused"));
    assert_eq!(doc["cadetId"], json!("42"));
}

#[tokio::test]
async fn test_single_slot_update_preserves_other_slots() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    let mut body = AttendanceRecord::unset("7".into(), week())
        .with(Slot::LabThursday, Status::Excused)
        .to_fields();
    body.insert("note".into(), json!("left early"));
    store
        .seed(Collection::Attendance, "2026-01-19_7", body)
        .await;

    let record = repo
        .update_single_slot(
            &CadetId::from("7"),
            Weekday::Wednesday,
            Status::Present,
            week(),
            ActivityType::Pt,
        )
        .await
        .unwrap();
    assert_eq!(record.get(Slot::LabThursday), Status::Excused);

    let doc = store
        .document(Collection::Attendance, "2026-01-19_7")
        .await
        .unwrap();
    assert_eq!(doc["ptWednesday"], json!("present"));
    assert_eq!(doc["labThursday"], json!("excused"));
    assert_eq!(doc["note"], json!("left early"));
}

#[tokio::test]
async fn test_batch_update_chunks_at_limit() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    let records: Vec<AttendanceRecord> = (0..1200)
        .map(|i| {
            AttendanceRecord::unset(CadetId::from(i.to_string()), week())
                .with(Slot::PtFriday, Status::Present)
        })
        .collect();

    let batches = repo.batch_update_records(&records).await.unwrap();

    assert_eq!(batches, 3);
    assert_eq!(store.stats().batch_writes, 3);
    assert_eq!(store.len(Collection::Attendance).await, 1200);
}

#[tokio::test]
async fn test_failed_batch_reports_remote_error() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    store.set_fail_writes(true);
    let records = vec![
        AttendanceRecord::unset("1".into(), week()),
        AttendanceRecord::unset("2".into(), week()),
    ];

    let result = repo.batch_update_records(&records).await;
    match result {
        Err(RosterError::Remote { operation, .. }) => assert_eq!(operation, "batch upsert"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_legacy_documents_normalized_on_read() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    store
        .seed(
            Collection::Attendance,
            "2026-01-19_7",
            fields(json!({
                "cadetId": 7,
                "weekStartDate": "2026-01-19",
                "monday": "P",
                "wednesday": "U",
                "lab": true,
                "tactics": null
            })),
        )
        .await;

    let map = repo.attendance_for_cadets(&ids(&["7"]), week()).await.unwrap();
    let record = &map[&CadetId::from("7")];
    assert_eq!(record.get(Slot::PtMonday), Status::Present);
    assert_eq!(record.get(Slot::PtWednesday), Status::Unexcused);
    assert_eq!(record.get(Slot::LabThursday), Status::Present);
    assert_eq!(record.get(Slot::TacticsTuesday), Status::Unset);

    // Reads never rewrite the stored document.
    let doc = store
        .document(Collection::Attendance, "2026-01-19_7")
        .await
        .unwrap();
    assert!(doc.get("ptMonday").is_none());
}

#[tokio::test]
async fn test_unexcused_aggregates() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    let earlier = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
    seed_record(
        &store,
        &AttendanceRecord::unset("1".into(), earlier).with(Slot::PtFriday, Status::Unexcused),
    )
    .await;
    seed_record(
        &store,
        &AttendanceRecord::unset("1".into(), week())
            .with(Slot::PtTuesday, Status::Unexcused)
            .with(Slot::TacticsTuesday, Status::Unexcused)
            .with(Slot::PtMonday, Status::Excused),
    )
    .await;

    let cadet = CadetId::from("1");
    assert_eq!(repo.lifetime_unexcused(&cadet).await.unwrap(), 3);
    assert_eq!(
        repo.unexcused_dates(&cadet).await.unwrap(),
        vec![
            NaiveDate::from_ymd_opt(2026, 1, 16).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 20).unwrap(),
        ]
    );
}

#[tokio::test]
async fn test_lifetime_counts_use_chunked_in_queries() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::with_limits(500, 10));
    let cadets: Vec<CadetId> = (0..25).map(|i| CadetId::from(i.to_string())).collect();
    for id in cadets.iter().take(3) {
        seed_record(
            &store,
            &AttendanceRecord::unset(id.clone(), week()).with(Slot::PtMonday, Status::Unexcused),
        )
        .await;
    }

    let counts = repo.lifetime_unexcused_many(&cadets).await.unwrap();

    // numeric ids take two values each (string and number form): 5 ids per query
    assert_eq!(store.stats().queries, 5);
    assert_eq!(counts.len(), 25);
    assert_eq!(counts[&CadetId::from("0")], 1);
    assert_eq!(counts[&CadetId::from("24")], 0);
}

#[tokio::test]
async fn test_query_retried_once() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    seed_cadet(&store, "1", "Adams", "Alpha").await;

    store.fail_next_queries(1);
    let cadets = repo.get_cadets(&RosterScope::All).await.unwrap();
    assert_eq!(cadets.len(), 1);

    store.fail_next_queries(2);
    let result = repo.get_cadets(&RosterScope::All).await;
    assert!(matches!(result, Err(RosterError::Remote { .. })));
}

#[tokio::test]
async fn test_clear_all_resets_every_slot() {
    let (store, repo, _temp) = create_repo(Duration::from_secs(60), InMemoryRemoteStore::with_limits(2, 10));
    for id in ["1", "2", "3"] {
        seed_record(
            &store,
            &AttendanceRecord::unset(id.into(), week())
                .with(Slot::PtMonday, Status::Present)
                .with(Slot::LabThursday, Status::Unexcused),
        )
        .await;
    }
    repo.attendance_for_cadets(&ids(&["1", "2", "3"]), week())
        .await
        .unwrap();

    let cleared = repo.clear_all_attendance().await.unwrap();
    assert_eq!(cleared, 3);
    assert_eq!(store.stats().batch_writes, 2);
    assert!(repo.cache().entries().is_empty());

    let map = repo
        .attendance_for_cadets(&ids(&["1", "2", "3"]), week())
        .await
        .unwrap();
    assert!(map.values().all(|r| r.is_unset()));
    let doc = store
        .document(Collection::Attendance, "2026-01-19_2")
        .await
        .unwrap();
    assert_eq!(doc["cadetId"], json!("2"));
}

#[tokio::test]
async fn test_invalid_week_and_slot_rejected() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    let cadet = CadetId::from("1");
    let tuesday = NaiveDate::from_ymd_opt(2026, 1, 20).unwrap();

    let result = repo
        .update_single_slot(&cadet, Weekday::Monday, Status::Present, tuesday, ActivityType::Pt)
        .await;
    assert!(matches!(result, Err(RosterError::InvalidWeek(d)) if d == tuesday));

    let result = repo
        .update_single_slot(&cadet, Weekday::Monday, Status::Present, week(), ActivityType::Lab)
        .await;
    assert!(matches!(
        result,
        Err(RosterError::InvalidSlot {
            activity: ActivityType::Lab,
            day: Weekday::Monday
        })
    ));

    let misdated = AttendanceRecord::unset(cadet, tuesday);
    assert!(repo.update_whole_record(&misdated).await.is_err());
    assert_eq!(store.stats().single_writes, 0);
}

#[tokio::test]
async fn test_single_slot_update_on_numeric_id_record() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    store
        .seed(
            Collection::Attendance,
            "2026-01-19_7",
            fields(json!({
                "cadetId": 7,
                "weekStartDate": "2026-01-19",
                "labThursday": "excused"
            })),
        )
        .await;

    let existing = repo.fetch_record(&CadetId::from("7"), week()).await.unwrap();
    assert_eq!(existing.unwrap().get(Slot::LabThursday), Status::Excused);

    repo.update_single_slot(
        &CadetId::from("7"),
        Weekday::Wednesday,
        Status::Present,
        week(),
        ActivityType::Pt,
    )
    .await
    .unwrap();

    let doc = store
        .document(Collection::Attendance, "2026-01-19_7")
        .await
        .unwrap();
    assert_eq!(doc["labThursday"], json!("excused"));
    assert_eq!(doc["ptWednesday"], json!("present"));
}

#[tokio::test]
async fn test_single_slot_update_on_legacy_record() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    store
        .seed(
            Collection::Attendance,
            "2026-01-19_8",
            fields(json!({
                "cadetId": 8,
                "weekStartDate": "2026-01-19",
                "monday": "E",
                "tactics": "U"
            })),
        )
        .await;

    let record = repo
        .update_single_slot(
            &CadetId::from("8"),
            Weekday::Friday,
            Status::Present,
            week(),
            ActivityType::Pt,
        )
        .await
        .unwrap();
    assert_eq!(record.get(Slot::PtMonday), Status::Excused);
    assert_eq!(record.get(Slot::TacticsTuesday), Status::Unexcused);

    let doc = store
        .document(Collection::Attendance, "2026-01-19_8")
        .await
        .unwrap();
    assert_eq!(doc["ptMonday"], json!("excused"));
    assert_eq!(doc["tacticsTuesday"], json!("unexcused"));
    assert_eq!(doc["ptFriday"], json!("present"));
}

#[tokio::test]
async fn test_history_includes_numeric_id_records() {
    let (store, repo, _temp) = create_repo(Duration::ZERO, InMemoryRemoteStore::new());
    let earlier = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
    store
        .seed(
            Collection::Attendance,
            "2026-01-12_9",
            fields(json!({
                "cadetId": 9,
                "weekStartDate": "2026-01-12",
                "ptMonday": "unexcused"
            })),
        )
        .await;
    seed_record(
        &store,
        &AttendanceRecord::unset("9".into(), week()).with(Slot::PtTuesday, Status::Unexcused),
    )
    .await;
    // "09" is another cadet whose id parses to the same number
    seed_record(
        &store,
        &AttendanceRecord::unset("09".into(), earlier).with(Slot::PtFriday, Status::Unexcused),
    )
    .await;

    let cadet = CadetId::from("9");
    assert_eq!(repo.lifetime_unexcused(&cadet).await.unwrap(), 2);
    assert_eq!(repo.lifetime_unexcused(&CadetId::from("09")).await.unwrap(), 1);
    assert_eq!(
        repo.unexcused_dates(&cadet).await.unwrap(),
        vec![earlier, NaiveDate::from_ymd_opt(2026, 1, 20).unwrap()]
    );

    let counts = repo
        .lifetime_unexcused_many(&[CadetId::from("9"), CadetId::from("10")])
        .await
        .unwrap();
    assert_eq!(counts[&CadetId::from("9")], 2);
    assert_eq!(counts[&CadetId::from("10")], 0);
}
