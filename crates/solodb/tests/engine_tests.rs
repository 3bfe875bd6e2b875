//! End-to-end engine tests over the public API.

use std::io::Write;

use pretty_assertions::assert_eq;
use solodb::{doc, Document, EngineOptions, FindOptions, Order, Query, SoloDb, SoloError, Value};
use tempfile::TempDir;

fn open(dir: &TempDir, name: &str) -> SoloDb {
    SoloDb::open(dir.path().join(name)).unwrap()
}

#[test]
fn insert_then_find_by_pk_round_trips() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    let doc = doc! { "_id" => 1, "name" => "ada", "score" => 9.5, "active" => true };
    db.insert("users", doc.clone()).unwrap();

    let found = db.find_by_id("users", &Value::Int32(1)).unwrap().unwrap();
    assert_eq!(found, doc);
}

#[test]
fn generated_object_ids_are_returned_and_queryable() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    let id = db.insert("users", doc! { "name" => "no-id" }).unwrap();
    assert!(matches!(id, Value::ObjectId(_)));

    let found = db.find_by_id("users", &id).unwrap().unwrap();
    assert_eq!(found.id(), Some(&id));
    assert_eq!(found["name"].as_str(), Some("no-id"));
}

#[test]
fn unique_index_rejects_duplicates_scenario() {
    // The canonical scenario: users with a unique email index
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.ensure_index("users", "email", true).unwrap();
    db.insert("users", doc! { "_id" => 1, "email" => "a@x.com" })
        .unwrap();

    let err = db
        .insert("users", doc! { "_id" => 2, "email" => "a@x.com" })
        .unwrap_err();
    assert!(matches!(err, SoloError::DuplicateKey { .. }));

    // Exactly one document remains, and it is _id 1
    let docs: Vec<Document> = db
        .find("users", Query::eq("email", "a@x.com"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id(), Some(&Value::Int32(1)));

    // The failed insert rolled back completely
    assert_eq!(db.count("users", &Query::all()).unwrap(), 1);
    assert!(db.find_by_id("users", &Value::Int32(2)).unwrap().is_none());
}

#[test]
fn duplicate_pk_is_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.insert("users", doc! { "_id" => 7 }).unwrap();
    let err = db.insert("users", doc! { "_id" => 7 }).unwrap_err();
    assert!(matches!(err, SoloError::DuplicateKey { .. }));
}

#[test]
fn chained_document_round_trips() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    // Far larger than one 4KB page
    let blob: Vec<u8> = (0..40_000u32).map(|i| (i % 241) as u8).collect();
    db.insert("files", doc! { "_id" => 1, "blob" => blob.clone() })
        .unwrap();

    let found = db.find_by_id("files", &Value::Int32(1)).unwrap().unwrap();
    assert_eq!(found["blob"], Value::Binary(blob));

    // Shrinking the payload back down still round-trips
    db.update("files", &doc! { "_id" => 1, "blob" => vec![1u8, 2, 3] })
        .unwrap();
    let found = db.find_by_id("files", &Value::Int32(1)).unwrap().unwrap();
    assert_eq!(found["blob"], Value::Binary(vec![1, 2, 3]));
}

#[test]
fn data_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir, "test.db");
        db.ensure_index("users", "email", true).unwrap();
        db.insert("users", doc! { "_id" => 1, "email" => "a@x.com" })
            .unwrap();
    }

    let db = open(&dir, "test.db");
    let found = db
        .first("users", Query::eq("email", "a@x.com"))
        .unwrap()
        .unwrap();
    assert_eq!(found.id(), Some(&Value::Int32(1)));

    // The unique index survived too
    let err = db
        .insert("users", doc! { "_id" => 2, "email" => "a@x.com" })
        .unwrap_err();
    assert!(matches!(err, SoloError::DuplicateKey { .. }));
}

#[test]
fn explicit_transaction_commit_and_rollback() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.begin_trans().unwrap();
    for i in 0..3 {
        db.insert("items", doc! { "_id" => i }).unwrap();
    }
    db.rollback().unwrap();
    assert_eq!(db.count("items", &Query::all()).unwrap(), 0);

    db.begin_trans().unwrap();
    for i in 0..3 {
        db.insert("items", doc! { "_id" => i }).unwrap();
    }
    db.commit().unwrap();
    assert_eq!(db.count("items", &Query::all()).unwrap(), 3);
}

#[test]
fn crash_mid_commit_recovers_old_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    // Committed baseline: one document
    {
        let db = SoloDb::open(&path).unwrap();
        db.insert("docs", doc! { "_id" => 1, "v" => "old" }).unwrap();
    }
    let old_bytes = std::fs::read(&path).unwrap();

    // A later transaction inserts three more documents
    {
        let db = SoloDb::open(&path).unwrap();
        db.begin_trans().unwrap();
        for i in 2..5 {
            db.insert("docs", doc! { "_id" => i, "v" => "new" }).unwrap();
        }
        db.commit().unwrap();
    }

    // Crash scene: the new state was flushed, but the journal (holding the
    // old pages) was never deleted. Recovery must win and restore the old
    // state, because journal deletion is the commit point.
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(&old_bytes).unwrap();
        file.sync_all().unwrap();
    }

    let db = SoloDb::open(&path).unwrap();
    assert_eq!(db.count("docs", &Query::all()).unwrap(), 1);
    let found = db.find_by_id("docs", &Value::Int32(1)).unwrap().unwrap();
    assert_eq!(found["v"].as_str(), Some("old"));
    for i in 2..5 {
        assert!(db.find_by_id("docs", &Value::Int32(i)).unwrap().is_none());
    }

    // The file works normally after recovery
    db.insert("docs", doc! { "_id" => 99 }).unwrap();
    assert_eq!(db.count("docs", &Query::all()).unwrap(), 2);
}

#[test]
fn torn_journal_tail_does_not_block_recovery() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    {
        let db = SoloDb::open(&path).unwrap();
        db.insert("docs", doc! { "_id" => 1 }).unwrap();
    }

    // A torn (half-written) trailing page must be skipped, not fatal
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(&vec![0u8; 4096]).unwrap();
        file.write_all(&[0xAB; 100]).unwrap();
        file.sync_all().unwrap();
    }

    let db = SoloDb::open(&path).unwrap();
    assert_eq!(db.count("docs", &Query::all()).unwrap(), 1);
}

#[test]
fn concurrent_readers_never_see_torn_documents() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    const WRITES: i32 = 300;
    const READERS: usize = 4;

    // Writer inserts documents holding an invariant: b == a * 2
    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            for i in 0..WRITES {
                db.insert("pairs", doc! { "_id" => i, "a" => i, "b" => i * 2 })
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..READERS)
        .map(|r| {
            let db = db.clone();
            std::thread::spawn(move || {
                let mut observed = 0usize;
                for round in 0..WRITES {
                    let i = (round + r as i32 * 37) % WRITES;
                    if let Some(d) = db.find_by_id("pairs", &Value::Int32(i)).unwrap() {
                        // Every visible document is fully formed
                        let a = d["a"].as_i32().unwrap();
                        let b = d["b"].as_i32().unwrap();
                        assert_eq!(b, a * 2);
                        assert_eq!(a, i);
                        observed += 1;
                    }
                }
                observed
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(db.count("pairs", &Query::all()).unwrap(), WRITES as u64);
}

#[test]
fn secondary_index_queries_and_updates() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.ensure_index("people", "age", false).unwrap();
    for (id, age) in [(1, 30), (2, 40), (3, 30), (4, 55)] {
        db.insert("people", doc! { "_id" => id, "age" => age }).unwrap();
    }

    let indexes = db.index_list("people").unwrap();
    assert_eq!(indexes.len(), 2);
    assert_eq!(indexes[0].field, "_id");
    assert_eq!(indexes[1].field, "age");
    assert!(!indexes[1].unique);
    // Creating it again is a no-op
    assert!(!db.ensure_index("people", "age", false).unwrap());

    assert_eq!(db.count("people", &Query::eq("age", 30)).unwrap(), 2);
    assert_eq!(db.count("people", &Query::gt("age", 35)).unwrap(), 2);
    assert_eq!(db.count("people", &Query::between("age", 30, 40)).unwrap(), 3);

    // Re-keying an indexed field moves the document between key ranges
    db.update("people", &doc! { "_id" => 1, "age" => 60 }).unwrap();
    assert_eq!(db.count("people", &Query::eq("age", 30)).unwrap(), 1);
    assert_eq!(db.count("people", &Query::gt("age", 50)).unwrap(), 2);

    // And the documents still resolve through the index
    let seniors: Vec<Document> = db
        .find("people", Query::gt("age", 50))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(seniors.len(), 2);
    for doc in seniors {
        assert!(doc["age"].as_i32().unwrap() > 50);
    }
}

#[test]
fn find_options_order_skip_limit_projection() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    for i in 0..10 {
        db.insert("nums", doc! { "_id" => i, "n" => 9 - i, "junk" => "x" })
            .unwrap();
    }

    let options = FindOptions {
        order_by: Some(("n".into(), Order::Descending)),
        skip: 2,
        limit: Some(3),
        projection: Some(vec!["n".into()]),
    };
    let docs: Vec<Document> = db
        .find_with("nums", Query::all(), options)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let ns: Vec<i32> = docs.iter().map(|d| d["n"].as_i32().unwrap()).collect();
    assert_eq!(ns, vec![7, 6, 5]);
    // Projection dropped every other field
    assert!(docs.iter().all(|d| d.len() == 1));
}

#[test]
fn or_queries_union_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.ensure_index("users", "age", false).unwrap();
    for (id, age) in [(1, 20), (2, 30), (3, 40)] {
        db.insert("users", doc! { "_id" => id, "age" => age }).unwrap();
    }

    // Both branches match _id 3; the union must emit it once
    let query = Query::or(Query::gt("age", 25), Query::eq("_id", 3));
    assert_eq!(db.count("users", &query).unwrap(), 2);
}

#[test]
fn delete_and_delete_many() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    for i in 0..10 {
        db.insert("items", doc! { "_id" => i, "n" => i }).unwrap();
    }

    assert!(db.delete("items", &Value::Int32(0)).unwrap());
    assert!(!db.delete("items", &Value::Int32(0)).unwrap());

    let deleted = db.delete_many("items", &Query::lt("n", 5)).unwrap();
    assert_eq!(deleted, 4);
    assert_eq!(db.count("items", &Query::all()).unwrap(), 5);
}

#[test]
fn upsert_inserts_then_updates() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    assert!(db.upsert("kv", doc! { "_id" => 1, "v" => "a" }).unwrap());
    assert!(!db.upsert("kv", doc! { "_id" => 1, "v" => "b" }).unwrap());

    let found = db.find_by_id("kv", &Value::Int32(1)).unwrap().unwrap();
    assert_eq!(found["v"].as_str(), Some("b"));
    assert_eq!(db.count("kv", &Query::all()).unwrap(), 1);
}

#[test]
fn min_max_count_exists() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.ensure_index("m", "n", false).unwrap();
    for n in [5, 1, 9, 3] {
        db.insert("m", doc! { "_id" => n, "n" => n }).unwrap();
    }

    assert_eq!(db.min("m", "n").unwrap(), Some(Value::Int32(1)));
    assert_eq!(db.max("m", "n").unwrap(), Some(Value::Int32(9)));
    assert_eq!(db.min("m", "_id").unwrap(), Some(Value::Int32(1)));
    assert!(db.exists("m", &Query::eq("n", 9)).unwrap());
    assert!(!db.exists("m", &Query::eq("n", 2)).unwrap());
    assert!(matches!(
        db.min("m", "unindexed"),
        Err(SoloError::IndexNotFound(_))
    ));
}

#[test]
fn explain_reports_chosen_plan() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.ensure_index("users", "email", true).unwrap();
    db.insert("users", doc! { "_id" => 1, "email" => "a@x.com", "age" => 30 })
        .unwrap();

    let plan = db
        .explain("users", &Query::eq("email", "a@x.com"))
        .unwrap();
    assert!(plan.starts_with("INDEX SEEK \"email_1\""));
    assert!(plan.contains("UNIQUE"));

    let plan = db
        .explain(
            "users",
            &Query::and(Query::eq("email", "a@x.com"), Query::gt("age", 10)),
        )
        .unwrap();
    assert!(plan.contains("FILTER"));

    let plan = db
        .explain_with("users", &Query::all(), Some(("age", Order::Ascending)))
        .unwrap();
    assert!(plan.contains("SORT (age ASC)"));

    assert_eq!(db.explain("missing", &Query::all()).unwrap(), "NO COLLECTION");
}

#[test]
fn collection_management() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    db.insert("a", doc! { "_id" => 1 }).unwrap();
    db.insert("b", doc! { "_id" => 1 }).unwrap();
    assert_eq!(db.collection_names().unwrap(), vec!["a", "b"]);

    assert!(db.rename_collection("a", "c").unwrap());
    assert!(db.find_by_id("c", &Value::Int32(1)).unwrap().is_some());
    assert!(db.find_by_id("a", &Value::Int32(1)).unwrap().is_none());

    assert!(db.drop_collection("b").unwrap());
    assert!(!db.drop_collection("b").unwrap());
    assert_eq!(db.collection_names().unwrap(), vec!["c"]);

    assert!(matches!(
        db.insert("bad name", doc! { "_id" => 1 }),
        Err(SoloError::InvalidName(_))
    ));
}

#[test]
fn shrink_reclaims_space_and_keeps_documents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let db = SoloDb::open(&path).unwrap();

    db.ensure_index("docs", "tag", false).unwrap();
    for i in 0..300 {
        db.insert(
            "docs",
            doc! { "_id" => i, "tag" => format!("tag-{}", i % 7), "pad" => vec![0u8; 512] },
        )
        .unwrap();
    }
    db.delete_many("docs", &Query::lt("_id", 280)).unwrap();

    let before = std::fs::metadata(&path).unwrap().len();
    let reclaimed = db.shrink().unwrap();
    let after = std::fs::metadata(&path).unwrap().len();

    assert!(reclaimed > 0);
    assert!(after < before);

    // Every surviving document is intact and still indexed
    assert_eq!(db.count("docs", &Query::all()).unwrap(), 20);
    for i in 280..300 {
        let found = db.find_by_id("docs", &Value::Int32(i)).unwrap().unwrap();
        assert_eq!(found["pad"], Value::Binary(vec![0u8; 512]));
    }
    assert_eq!(db.count("docs", &Query::eq("tag", "tag-0")).unwrap(), 3);

    // And the shrunk file reopens cleanly
    drop(db);
    let db = SoloDb::open(&path).unwrap();
    assert_eq!(db.count("docs", &Query::all()).unwrap(), 20);
}

#[test]
fn password_protected_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    {
        let db = SoloDb::open_with(
            &path,
            EngineOptions {
                password: Some("hunter2".into()),
                ..EngineOptions::default()
            },
        )
        .unwrap();
        db.insert("secrets", doc! { "_id" => 1 }).unwrap();
    }

    assert!(matches!(
        SoloDb::open(&path),
        Err(SoloError::WrongPassword)
    ));
    assert!(matches!(
        SoloDb::open_with(
            &path,
            EngineOptions {
                password: Some("wrong".into()),
                ..EngineOptions::default()
            },
        ),
        Err(SoloError::WrongPassword)
    ));

    let db = SoloDb::open_with(
        &path,
        EngineOptions {
            password: Some("hunter2".into()),
            ..EngineOptions::default()
        },
    )
    .unwrap();
    assert!(db.find_by_id("secrets", &Value::Int32(1)).unwrap().is_some());
}

#[test]
fn shared_opens_use_one_engine() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let a = SoloDb::open(&path).unwrap();
    let b = SoloDb::open(&path).unwrap();

    // A write through one handle is immediately visible through the other
    a.insert("shared", doc! { "_id" => 1 }).unwrap();
    assert!(b.find_by_id("shared", &Value::Int32(1)).unwrap().is_some());

    // An open transaction on one handle is an open transaction on both
    a.begin_trans().unwrap();
    assert!(matches!(b.begin_trans(), Err(SoloError::Transaction(_))));
    a.rollback().unwrap();
}

#[test]
fn read_only_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    {
        let db = SoloDb::open(&path).unwrap();
        db.insert("r", doc! { "_id" => 1 }).unwrap();
    }

    let db = SoloDb::open_with(
        &path,
        EngineOptions {
            read_only: true,
            ..EngineOptions::default()
        },
    )
    .unwrap();

    assert!(db.find_by_id("r", &Value::Int32(1)).unwrap().is_some());
    assert!(matches!(
        db.insert("r", doc! { "_id" => 2 }),
        Err(SoloError::ReadOnly)
    ));
    assert!(matches!(db.begin_trans(), Err(SoloError::ReadOnly)));
}

#[test]
fn invalid_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    let mut bad = Document::new();
    bad.set("_id", Value::Null);
    assert!(matches!(
        db.insert("x", bad),
        Err(SoloError::InvalidId(_))
    ));

    let mut no_id = Document::new();
    no_id.set("v", 1);
    assert!(matches!(
        db.update("x", &no_id),
        Err(SoloError::InvalidId(_))
    ));
}

#[test]
fn stats_reports_pages_and_collections() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "test.db");

    for i in 0..20 {
        db.insert("s", doc! { "_id" => i }).unwrap();
    }

    let stats = db.stats().unwrap();
    assert_eq!(stats.pages_by_type["header"], 1);
    assert!(stats.pages_by_type["collection"] >= 1);
    assert!(stats.pages_by_type["index"] >= 1);
    assert!(stats.pages_by_type["data"] >= 1);
    assert_eq!(stats.collections["s"], 20);
    assert!(stats.file_size >= stats.page_count * 4096);
}
