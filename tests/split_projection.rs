use embedfan::{FanoutConfig, SplitConfig, prepare, split};
use serde_json::json;
use store::{DocumentStore, ID_FIELD, InMemoryStore, document};

fn fanned_out_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    store
        .insert_many(
            "embedded_movies",
            vec![
                document(json!({
                    "_id": "m1",
                    "title": "The Great Train Robbery",
                    "year": 1903,
                    "plot_embedding": [0.1, -0.2, 0.3],
                })),
                document(json!({
                    "_id": "m2",
                    "title": "Blacksmith Scene",
                    "year": 1893,
                    "plot_embedding": [0.5, 0.5, -0.5],
                })),
            ],
        )
        .expect("seed source");
    store
}

#[test]
fn prepare_writes_all_three_collections() {
    let store = fanned_out_store();
    let fanout = FanoutConfig {
        copies: 3,
        ..Default::default()
    };

    let report = prepare(&store, &fanout, &SplitConfig::default()).expect("prepare");

    assert_eq!(report.fanout.output_rows, 6);
    assert_eq!(report.split.vectors_rows, 6);
    assert_eq!(report.split.metadata_rows, 6);
    let mut names = store.collection_names().unwrap();
    names.sort();
    assert_eq!(
        names,
        vec![
            "embedded_movies",
            "embeddings_only",
            "movies_only",
            "movies_with_embed"
        ]
    );
}

#[test]
fn vectors_collection_holds_only_the_vector_and_identifier() {
    let store = fanned_out_store();
    let fanout = FanoutConfig {
        copies: 2,
        ..Default::default()
    };
    prepare(&store, &fanout, &SplitConfig::default()).expect("prepare");

    for row in store.find_all("embeddings_only").unwrap() {
        let mut keys: Vec<&str> = row.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, vec![ID_FIELD, "plot_embedding"]);
        assert_eq!(row["plot_embedding"].as_array().map(Vec::len), Some(3));
    }
}

#[test]
fn metadata_collection_keeps_everything_but_the_vector() {
    let store = fanned_out_store();
    let fanout = FanoutConfig {
        copies: 2,
        ..Default::default()
    };
    prepare(&store, &fanout, &SplitConfig::default()).expect("prepare");

    let rows = store.find_all("movies_only").unwrap();
    assert_eq!(rows.len(), 4);
    for row in &rows {
        assert!(!row.contains_key("plot_embedding"));
        assert!(row.contains_key("title"));
        assert!(row.contains_key("year"));
        assert!(row.contains_key(ID_FIELD));
    }
}

#[test]
fn split_rows_join_back_on_identifier() {
    let store = fanned_out_store();
    let fanout = FanoutConfig {
        copies: 4,
        ..Default::default()
    };
    prepare(&store, &fanout, &SplitConfig::default()).expect("prepare");

    let full = store.find_all("movies_with_embed").unwrap();
    let vectors = store.find_all("embeddings_only").unwrap();
    let metadata = store.find_all("movies_only").unwrap();

    for row in &full {
        let id = &row[ID_FIELD];
        let vector = vectors
            .iter()
            .find(|v| &v[ID_FIELD] == id)
            .expect("vector row for id");
        let meta = metadata
            .iter()
            .find(|m| &m[ID_FIELD] == id)
            .expect("metadata row for id");
        assert_eq!(vector["plot_embedding"], row["plot_embedding"]);
        assert_eq!(meta["title"], row["title"]);
    }
}

#[test]
fn split_is_idempotent_and_leaves_its_source_alone() {
    let store = fanned_out_store();
    let fanout = FanoutConfig {
        copies: 2,
        ..Default::default()
    };
    embedfan::fanout::run(&store, &fanout).expect("fanout");
    let before = store.find_all("movies_with_embed").unwrap();

    let cfg = SplitConfig::default();
    split::run(&store, &cfg).expect("first split");
    let first = store.find_all("movies_only").unwrap();
    split::run(&store, &cfg).expect("second split");

    assert_eq!(store.find_all("movies_only").unwrap(), first);
    assert_eq!(store.count("embeddings_only").unwrap(), 4);
    assert_eq!(store.find_all("movies_with_embed").unwrap(), before);
}

#[test]
fn split_of_missing_source_writes_empty_collections() {
    let store = InMemoryStore::new();
    let report = split::run(&store, &SplitConfig::default()).expect("split");
    assert_eq!(report.vectors_rows, 0);
    assert_eq!(report.metadata_rows, 0);
    assert_eq!(store.count("embeddings_only").unwrap(), 0);
}
