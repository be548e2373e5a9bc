use std::sync::Arc;

use bytes::Bytes;
use chunkstore::{
    BuildOutcome, CHUNK_TYPE, DATA, DATA_TYPE, DeleteMode, DeleteTarget, Item, ItemStore, Lookup,
    MAX_CHUNK_SIZE, NewRecord, PRIMARY_CHUNK, ProcessStage, RECORD_ID, RecordState, ScanOptions,
    Table, TableOptions, TableRecord, TableStore, encode, split,
};
use common::Storage;
use opendata_macros::storage_test;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct JournalArticle {
    doi: Option<String>,
    title: Option<String>,
    authors: Vec<String>,
    year: Option<i64>,
    abstract_text: Option<String>,
    full_text: Option<String>,
}

impl TableRecord for JournalArticle {
    const DATA_TYPE: &'static str = "journal_article";

    fn field_names() -> &'static [&'static str] {
        &[
            "doi",
            "title",
            "authors",
            "year",
            "abstract_text",
            "full_text",
        ]
    }

    fn fat_field_names() -> &'static [&'static str] {
        &["abstract_text", "full_text"]
    }
}

fn articles(storage: Arc<dyn Storage>) -> (Table<JournalArticle>, Arc<dyn ItemStore>) {
    let store: Arc<dyn ItemStore> = Arc::new(TableStore::new(storage, "articles"));
    let table = Table::new(store.clone(), TableOptions::default()).unwrap();
    (table, store)
}

/// Printable ASCII without characters JSON would escape.
fn random_text(seed: u64, len: usize) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut text = String::with_capacity(len);
    while text.len() < len {
        let c = char::from(rng.gen_range(0x20u8..0x7f));
        if c != '"' && c != '\\' {
            text.push(c);
        }
    }
    text
}

fn article(title: &str, full_text: Option<String>) -> JournalArticle {
    JournalArticle {
        doi: Some(format!("10.1000/{}", title)),
        title: Some(title.to_string()),
        authors: vec!["Ada Lovelace".to_string(), "Alan Turing".to_string()],
        year: Some(1843),
        abstract_text: Some("A short abstract.".to_string()),
        full_text,
    }
}

#[storage_test]
async fn should_store_and_rebuild_megabyte_field(storage: Arc<dyn Storage>) {
    // given
    let (table, _) = articles(storage);
    let full_text = random_text(7, 1_000_000);
    let encoded = encode(&full_text).unwrap().unwrap();
    let expected_slices = split(&encoded, MAX_CHUNK_SIZE).unwrap().len();
    let record = table.create(
        NewRecord::new(article("engine", Some(full_text.clone())))
            .with_source_unique("doi:10.1000/engine")
            .with_author("importer"),
    );

    // when
    let saved = table.save(&record).await.unwrap();
    let outcome = table.rebuild(Lookup::by_id(saved.record_id())).await.unwrap();

    // then
    assert!(expected_slices > 1);
    let full_text_chunks = saved
        .chunks()
        .iter()
        .filter(|c| c.starts_with("full_text_"))
        .count();
    assert_eq!(full_text_chunks, expected_slices);
    assert!(saved.chunks().iter().any(|c| c == PRIMARY_CHUNK));
    assert!(saved.chunks().iter().any(|c| c == "abstract_text_1"));
    assert!(outcome.error_items.is_empty());
    assert_eq!(outcome.records.len(), 1);
    let rebuilt = &outcome.records[0];
    assert_eq!(rebuilt.data(), saved.data());
    assert_eq!(rebuilt.data().full_text.as_deref(), Some(full_text.as_str()));
    assert_eq!(rebuilt.envelope(), saved.envelope());
    assert_eq!(rebuilt.state(), RecordState::Loaded);
}

#[storage_test]
async fn should_rebuild_nothing_after_delete(storage: Arc<dyn Storage>) {
    // given
    let (table, _) = articles(storage);
    let full_text = random_text(11, 500_000);
    let saved = table
        .save(&table.create(NewRecord::new(article("deleted", Some(full_text)))))
        .await
        .unwrap();

    // when
    let deleted = table
        .delete(
            DeleteTarget::Lookup(Lookup::by_id(saved.record_id())),
            DeleteMode::Batch,
        )
        .await
        .unwrap();
    let outcome = table.rebuild(Lookup::by_id(saved.record_id())).await.unwrap();

    // then
    assert_eq!(deleted, saved.chunks().len());
    assert!(outcome.is_empty());
}

#[storage_test]
async fn should_keep_rows_stable_when_saved_twice(storage: Arc<dyn Storage>) {
    // given
    let (table, _) = articles(storage);
    let mut record = table.create(
        NewRecord::new(article("twice", Some(random_text(3, 420_000))))
            .with_status(ProcessStage::Stage1),
    );
    table.save_in_place(&mut record).await.unwrap();
    let first_chunks = record.chunks().to_vec();

    // when
    table.save_in_place(&mut record).await.unwrap();
    let outcome = table.rebuild(Lookup::by_id(record.record_id())).await.unwrap();

    // then
    assert_eq!(record.chunks(), first_chunks.as_slice());
    assert_eq!(record.state(), RecordState::Persisted);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].data(), record.data());
    assert_eq!(outcome.records[0].envelope().data_status, ProcessStage::Stage1);
}

#[storage_test]
async fn should_shrink_record_when_fat_field_is_cleared(storage: Arc<dyn Storage>) {
    // given
    let (table, _) = articles(storage);
    let mut record = table.create(NewRecord::new(article(
        "shrinking",
        Some(random_text(5, 900_000)),
    )));
    table.save_in_place(&mut record).await.unwrap();

    // when
    record.data_mut().full_text = None;
    table.save_in_place(&mut record).await.unwrap();
    let outcome = table.rebuild(Lookup::by_id(record.record_id())).await.unwrap();

    // then
    assert!(record.chunks().iter().all(|c| !c.starts_with("full_text_")));
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].data().full_text, None);
    assert_eq!(outcome.records[0].chunks(), record.chunks());
}

#[storage_test]
async fn should_isolate_corrupt_record_during_scan(storage: Arc<dyn Storage>) {
    // given
    let (table, store) = articles(storage);
    let good = table
        .save(&table.create(NewRecord::new(article("good", None))))
        .await
        .unwrap();
    let orphan_slice = Item::new()
        .with(RECORD_ID, "broken")
        .with(CHUNK_TYPE, "full_text_2")
        .with(DATA_TYPE, JournalArticle::DATA_TYPE)
        .with(DATA, Bytes::from_static(b"not a payload"));
    store.put_item(orphan_slice.clone()).await.unwrap();

    // when
    let mut pages = table.iscan(ScanOptions::default());
    let mut outcome = BuildOutcome::default();
    while let Some(page) = pages.next().await.unwrap() {
        outcome.extend(page);
    }

    // then
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].record_id(), good.record_id());
    assert_eq!(outcome.error_items, vec![orphan_slice]);
}

#[storage_test]
async fn should_find_record_by_source_unique_once(storage: Arc<dyn Storage>) {
    // given
    let (table, _) = articles(storage);
    let mut first = table.create(
        NewRecord::new(article("unique", None)).with_source_unique("doi:10.1000/unique"),
    );
    let mut second = table.create(
        NewRecord::new(article("unique-again", None)).with_source_unique("doi:10.1000/unique"),
    );

    // when
    let first_inserted = table.insert_if_absent(&mut first).await.unwrap();
    let second_inserted = table.insert_if_absent(&mut second).await.unwrap();
    let outcome = table
        .rebuild(Lookup::by_source_unique("doi:10.1000/unique"))
        .await
        .unwrap();

    // then
    assert!(first_inserted);
    assert!(!second_inserted);
    assert!(table.exists("doi:10.1000/unique").await.unwrap());
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].data().title.as_deref(), Some("unique"));
}
