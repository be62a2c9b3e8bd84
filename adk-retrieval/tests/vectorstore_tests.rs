//! Property tests for the in-memory vector store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use adk_retrieval::{
    Distance, Document, HashingEmbedding, InMemoryVectorStore, ItemId, Query, VectorStore,
    VectorStoreOptions,
};
use proptest::prelude::*;

const DIM: usize = 8;

fn arb_embedding(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-1.0f32..1.0f32, dim)
}

/// Documents with distinct ids and explicit embeddings.
fn arb_documents(dim: usize) -> impl Strategy<Value = Vec<Document>> {
    proptest::collection::btree_map(0u64..500, ("[a-z ]{1,20}", arb_embedding(dim)), 1..20)
        .prop_map(|docs: BTreeMap<u64, (String, Vec<f32>)>| {
            docs.into_iter()
                .map(|(id, (content, embedding))| {
                    Document::new(id, "", content).with_content_embedding(embedding, "test")
                })
                .collect()
        })
}

fn arb_distance() -> impl Strategy<Value = Distance> {
    prop_oneof![Just(Distance::InnerProduct), Just(Distance::Cosine), Just(Distance::L2)]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn store(distance: Distance, batch_size: usize) -> InMemoryVectorStore {
    InMemoryVectorStore::with_options(VectorStoreOptions {
        distance,
        batch_size,
        ..VectorStoreOptions::default()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn results_are_ordered_and_bounded_by_k(
        docs in arb_documents(DIM),
        query in arb_embedding(DIM),
        k in 1usize..25,
        distance in arb_distance(),
    ) {
        let results = runtime().block_on(async {
            let store = store(distance, 7);
            store.create_collection("test", false, false).await.unwrap();
            store.insert_docs(&docs, None, false).await.unwrap();
            store
                .retrieve_docs(&[Query::new("q").with_k(k).with_embedding(query)], None)
                .await
                .unwrap()
        });

        prop_assert_eq!(results.len(), 1);
        let distances = &results.distances[0];
        prop_assert_eq!(distances.len(), k.min(docs.len()));
        prop_assert_eq!(results.ids[0].len(), distances.len());
        prop_assert_eq!(results.texts[0].len(), distances.len());
        for pair in distances.windows(2) {
            prop_assert!(pair[0] <= pair[1], "not ascending: {} > {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn upserting_twice_keeps_ids_unique(
        docs in arb_documents(DIM),
        query in arb_embedding(DIM),
    ) {
        let (results, stored) = runtime().block_on(async {
            let store = store(Distance::Cosine, 3);
            store.create_collection("test", false, false).await.unwrap();
            store.insert_docs(&docs, None, true).await.unwrap();
            store.insert_docs(&docs, None, true).await.unwrap();
            let results = store
                .retrieve_docs(&[Query::new("q").with_k(100).with_embedding(query)], None)
                .await
                .unwrap();
            let stored = store.get_docs_by_ids(None, None).await.unwrap();
            (results, stored)
        });

        let unique: BTreeSet<&ItemId> = results.ids[0].iter().collect();
        prop_assert_eq!(unique.len(), results.ids[0].len());
        prop_assert_eq!(results.ids[0].len(), docs.len());
        prop_assert_eq!(stored.len(), docs.len());
    }

    #[test]
    fn batch_size_does_not_change_stored_set(docs in arb_documents(DIM)) {
        let (small, large) = runtime().block_on(async {
            let mut sets = Vec::new();
            for batch_size in [1, 3] {
                let store = store(Distance::InnerProduct, batch_size);
                store.create_collection("test", false, false).await.unwrap();
                store.insert_docs(&docs, None, false).await.unwrap();
                let mut stored = store.get_docs_by_ids(None, None).await.unwrap();
                stored.sort_by(|a, b| a.id.cmp(&b.id));
                sets.push(stored);
            }
            let large = sets.pop().unwrap();
            let small = sets.pop().unwrap();
            (small, large)
        });
        prop_assert_eq!(small, large);
    }
}

#[tokio::test]
async fn collection_lifecycle() {
    let store = InMemoryVectorStore::new();

    store.create_collection("a", false, false).await.unwrap();
    let err = store.create_collection("a", false, false).await.unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(store.create_collection("a", false, true).await.unwrap().name, "a");

    let docs = vec![
        Document::new("x", "", "one").with_content_embedding(vec![1.0, 0.0], "test"),
        Document::new("y", "", "two").with_content_embedding(vec![0.0, 1.0], "test"),
    ];
    store.insert_docs(&docs, Some("a"), false).await.unwrap();

    store.create_collection("b", false, false).await.unwrap();
    assert_eq!(store.get_collection(None).await.unwrap().name, "b");
    assert_eq!(store.list_collections().await.unwrap().len(), 2);

    // Overwriting empties the collection.
    store.create_collection("a", true, false).await.unwrap();
    assert!(store.get_docs_by_ids(None, Some("a")).await.unwrap().is_empty());

    store.delete_collection("a").await.unwrap();
    assert!(store.get_collection(Some("a")).await.unwrap_err().is_not_found());
    assert_eq!(store.list_collections().await.unwrap(), vec!["b".to_string()]);
}

#[tokio::test]
async fn store_side_embedding_matches_query_side() {
    let store = InMemoryVectorStore::with_options(VectorStoreOptions {
        embedding_function: Some(Arc::new(HashingEmbedding::new(64))),
        ..VectorStoreOptions::default()
    });
    store.create_collection("docs", false, false).await.unwrap();
    store
        .insert_docs(
            &[
                Document::new(1u64, "", "tokio runtime spawns tasks"),
                Document::new(2u64, "", "serde derives serialization"),
            ],
            None,
            false,
        )
        .await
        .unwrap();

    let results =
        store.retrieve_docs(&[Query::new("serde serialization").with_k(1)], None).await.unwrap();
    assert_eq!(results.ids[0], vec![ItemId::Int(2)]);

    let stored = store.get_docs_by_ids(Some(&[ItemId::Int(1)]), None).await.unwrap();
    assert_eq!(stored[0].embedding_model.as_deref(), Some("hashing-64"));
    assert_eq!(stored[0].dimensions, Some(64));
}
