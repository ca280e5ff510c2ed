//! Property tests for cursor pagination and revision counting
//!
//! Pages of one cursor, fetched in any order, reassemble into exactly the
//! snapshot; the zone revision counts mutating calls and nothing else.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use auth_rebac::config::IteratorConfig;
use auth_rebac::iterator::{query_hash, IteratorCache};
use auth_rebac::repository::{InMemoryTupleRepository, TupleRepository};
use auth_rebac::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Item count, page size, and a shuffled order in which to request pages.
fn arb_paging() -> impl Strategy<Value = (usize, usize, Vec<usize>)> {
    (0usize..60, 1usize..12).prop_flat_map(|(total, page_size)| {
        let pages = total.div_ceil(page_size);
        (
            Just(total),
            Just(page_size),
            Just((0..pages).collect::<Vec<_>>()).prop_shuffle(),
        )
    })
}

#[derive(Debug, Clone)]
enum Mutation {
    Write(u8),
    Batch(Vec<u8>),
    DeleteExisting,
    DeleteUnknown,
}

fn arb_mutation() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        any::<u8>().prop_map(Mutation::Write),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Mutation::Batch),
        Just(Mutation::DeleteExisting),
        Just(Mutation::DeleteUnknown),
    ]
}

fn viewer(n: u8, zone: &ZoneId) -> NewTuple {
    NewTuple::new(
        Entity::user(&format!("u{}", n)),
        "direct_viewer",
        Entity::file(&format!("/f/{}", n)),
        zone.clone(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Pages requested in arbitrary order cover the snapshot exactly once
    #[test]
    fn pages_reassemble_snapshot((total, page_size, order) in arb_paging()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let cache: IteratorCache<usize> = IteratorCache::new(&IteratorConfig::default());
            let zone = ZoneId::new("props");
            let hash = query_hash(&["numbers", &total.to_string()]);

            let first = cache
                .get_or_create(&hash, &zone, || async move { Ok((0..total).collect()) }, page_size)
                .await
                .unwrap();
            assert_eq!(first.total, total);
            assert_eq!(first.next_cursor.is_some(), total > page_size);

            let mut pages = BTreeMap::new();
            for index in order {
                let page = cache
                    .get_page(&first.cursor_id, index * page_size, page_size)
                    .await
                    .unwrap();
                assert!(!page.items.is_empty());
                pages.insert(index, page.items);
            }
            let stitched: Vec<usize> = pages.into_values().flatten().collect();
            assert_eq!(stitched, (0..total).collect::<Vec<_>>());
        });
    }

    /// Expansion pages agree with the full expansion
    #[test]
    fn expand_pages_match_full_expand((total, page_size, order) in arb_paging()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = AuthorizationEngine::new(Arc::new(InMemoryTupleRepository::new())).unwrap();
            let zone = ZoneId::new("props");
            let tuples: Vec<NewTuple> = (0..total)
                .map(|i| {
                    NewTuple::new(
                        Entity::user(&format!("reader-{:03}", i)),
                        "direct_viewer",
                        Entity::file("/shared"),
                        zone.clone(),
                    )
                })
                .collect();
            engine.write_batch(tuples).await.unwrap();

            let full = engine.expand("read", Entity::file("/shared"), zone.clone()).await.unwrap();
            assert_eq!(full.len(), total);

            let first = engine
                .expand_page("read", Entity::file("/shared"), zone, Some(page_size))
                .await
                .unwrap();
            let mut pages = BTreeMap::new();
            for index in order {
                let page = engine
                    .expand_next(&first.cursor_id, index * page_size, page_size)
                    .await
                    .unwrap();
                pages.insert(index, page.items);
            }
            let stitched: Vec<Entity> = pages.into_values().flatten().collect();
            assert_eq!(stitched, full);
        });
    }

    /// Revision equals the number of effective mutating calls
    #[test]
    fn revision_counts_mutations(mutations in prop::collection::vec(arb_mutation(), 0..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let repo = Arc::new(InMemoryTupleRepository::new());
            let engine = AuthorizationEngine::new(repo.clone()).unwrap();
            let zone = ZoneId::new("props");

            let mut live: Vec<TupleId> = Vec::new();
            let mut expected = 0u64;
            for mutation in mutations {
                match mutation {
                    Mutation::Write(n) => {
                        let id = engine.write(viewer(n, &zone)).await.unwrap();
                        if !live.contains(&id) {
                            live.push(id);
                        }
                        expected += 1;
                    }
                    Mutation::Batch(ns) => {
                        let empty = ns.is_empty();
                        let ids = engine
                            .write_batch(ns.iter().map(|n| viewer(*n, &zone)).collect())
                            .await
                            .unwrap();
                        for id in ids {
                            if !live.contains(&id) {
                                live.push(id);
                            }
                        }
                        if !empty {
                            expected += 1;
                        }
                    }
                    Mutation::DeleteExisting => {
                        if let Some(id) = live.pop() {
                            assert!(engine.delete(id).await.unwrap());
                            expected += 1;
                        }
                    }
                    Mutation::DeleteUnknown => {
                        assert!(!engine.delete(TupleId::generate()).await.unwrap());
                    }
                }
                assert_eq!(repo.current_revision(&zone).await.unwrap(), expected);
            }
        });
    }
}
