//! Contract Test: Block Set Reconciliation
//!
//! Constraints verified:
//! - After reconciling, the stored set for a unit equals the published set
//! - Reconciling the same set twice writes nothing the second time
//! - Addresses in removed blocks are re-homed to another country's cover,
//!   or to the ZZ catch-all when none exists
//! - No observed address ever points at a deleted block
//!
//! If this test fails, the database drifts from the feed or loses addresses.

mod common;

use common::*;
use ipdeny_core::model::AddressFamily;
use ipdeny_core::{BlockStore, Error};
use std::sync::Arc;

#[tokio::test]
async fn us_scenario_migrates_orphan_to_sentinel() {
    let store = seeded_store(&["US", "ZZ"]).await;
    let engine = reconciler(Arc::new(store.clone()));
    let us = code("US");

    engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.0.0.0/8", "11.0.0.0/8"]))
        .await
        .unwrap();
    let observed = observe_in(&store, "10.5.5.5", "10.0.0.0/8").await;

    let outcome = engine
        .reconcile(&us, AddressFamily::V4, &nets(&["11.0.0.0/8", "12.0.0.0/8"]))
        .await
        .unwrap();

    let added: Vec<String> = outcome.added.iter().map(|b| b.network.to_string()).collect();
    let removed: Vec<String> = outcome.removed.iter().map(|b| b.network.to_string()).collect();
    assert_eq!(added, vec!["12.0.0.0/8"]);
    assert_eq!(removed, vec!["10.0.0.0/8"]);

    assert_eq!(outcome.migrated.len(), 1);
    assert_eq!(outcome.migrated[0].address.id, observed.id);
    assert_eq!(outcome.migrated[0].to_block.network.to_string(), "0.0.0.0/0");

    let zz = store.country_by_code(&code("ZZ")).await.unwrap().unwrap();
    assert_eq!(outcome.migrated[0].to_block.country_id, zz.id);

    assert_eq!(
        stored_set(&store, "US", AddressFamily::V4).await,
        nets(&["11.0.0.0/8", "12.0.0.0/8"])
    );
    assert_no_dangling(&store).await;
}

#[tokio::test]
async fn stored_set_matches_published_set() {
    let store = seeded_store(&["FR"]).await;
    let engine = reconciler(Arc::new(store.clone()));
    let fr = code("FR");

    for published in [
        nets(&["2001:db8::/32", "2001:db9::/32"]),
        nets(&["2001:db9::/32", "2a01::/16", "2a02::/16"]),
        nets(&[]),
        nets(&["2a01::/16"]),
    ] {
        engine
            .reconcile(&fr, AddressFamily::V6, &published)
            .await
            .unwrap();
        assert_eq!(stored_set(&store, "FR", AddressFamily::V6).await, published);
    }
}

#[tokio::test]
async fn second_identical_reconcile_writes_nothing() {
    let store = FaultyStore::new(seeded_store(&["DE"]).await);
    let engine = reconciler(Arc::new(store.clone()));
    let de = code("DE");
    let published = nets(&["5.0.0.0/8", "46.0.0.0/8"]);

    let first = engine
        .reconcile(&de, AddressFamily::V4, &published)
        .await
        .unwrap();
    assert_eq!(first.added.len(), 2);
    let writes = (store.removal_calls(), store.insertion_calls());

    let second = engine
        .reconcile(&de, AddressFamily::V4, &published)
        .await
        .unwrap();
    assert!(second.is_noop());
    assert!(second.migrated.is_empty());
    assert_eq!((store.removal_calls(), store.insertion_calls()), writes);
}

#[tokio::test]
async fn orphan_prefers_surviving_cover_over_sentinel() {
    let store = seeded_store(&["CA", "US", "ZZ"]).await;
    let engine = reconciler(Arc::new(store.clone()));

    engine
        .reconcile(&code("CA"), AddressFamily::V4, &nets(&["10.5.0.0/16"]))
        .await
        .unwrap();
    engine
        .reconcile(&code("US"), AddressFamily::V4, &nets(&["10.0.0.0/8"]))
        .await
        .unwrap();
    observe_in(&store, "10.5.5.5", "10.0.0.0/8").await;
    observe_in(&store, "10.9.9.9", "10.0.0.0/8").await;

    let outcome = engine
        .reconcile(&code("US"), AddressFamily::V4, &nets(&[]))
        .await
        .unwrap();
    assert_eq!(outcome.migrated.len(), 2);

    let moved = store
        .address_by_value("10.5.5.5".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    let target = store.block_by_id(moved.block_id).await.unwrap().unwrap();
    assert_eq!(target.network.to_string(), "10.5.0.0/16");

    let orphan = store
        .address_by_value("10.9.9.9".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    let catch_all = store.block_by_id(orphan.block_id).await.unwrap().unwrap();
    assert_eq!(catch_all.network, AddressFamily::V4.catch_all());

    assert_no_dangling(&store).await;
}

#[tokio::test]
async fn block_split_parks_address_on_catch_all() {
    let store = seeded_store(&["US", "ZZ"]).await;
    let engine = reconciler(Arc::new(store.clone()));
    let us = code("US");

    engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.0.0.0/8"]))
        .await
        .unwrap();
    observe_in(&store, "10.200.0.1", "10.0.0.0/8").await;

    // The new halves are inserted after the old block is gone, so the
    // address goes through the catch-all rather than dangling.
    let outcome = engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.0.0.0/9", "10.128.0.0/9"]))
        .await
        .unwrap();
    assert_eq!(outcome.added.len(), 2);
    assert_eq!(outcome.migrated.len(), 1);
    assert_eq!(
        outcome.migrated[0].to_block.network,
        AddressFamily::V4.catch_all()
    );

    // The row stays on the catch-all after the halves appear
    let parked = store
        .address_by_value("10.200.0.1".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.block_id, outcome.migrated[0].to_block.id);
    assert_no_dangling(&store).await;
}

#[tokio::test]
async fn nested_same_country_cover_is_not_a_candidate() {
    let store = seeded_store(&["US", "ZZ"]).await;
    let engine = reconciler(Arc::new(store.clone()));
    let us = code("US");

    engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.0.0.0/8", "10.5.0.0/16"]))
        .await
        .unwrap();
    let observed = observe_in(&store, "10.5.5.5", "10.5.0.0/16").await;

    // 10.0.0.0/8 survives and covers the address, but it is US's own block
    let outcome = engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.0.0.0/8"]))
        .await
        .unwrap();

    let zz = store.country_by_code(&code("ZZ")).await.unwrap().unwrap();
    assert_eq!(outcome.migrated.len(), 1);
    assert_eq!(outcome.migrated[0].address.id, observed.id);
    assert_eq!(outcome.migrated[0].to_block.country_id, zz.id);
    assert_eq!(
        outcome.migrated[0].to_block.network,
        AddressFamily::V4.catch_all()
    );
    assert_eq!(
        stored_set(&store, "US", AddressFamily::V4).await,
        nets(&["10.0.0.0/8"])
    );
    assert_no_dangling(&store).await;
}

#[tokio::test]
async fn nested_cover_of_another_country_wins_over_own_cover() {
    let store = seeded_store(&["CA", "US", "ZZ"]).await;
    let engine = reconciler(Arc::new(store.clone()));
    let us = code("US");

    engine
        .reconcile(&code("CA"), AddressFamily::V4, &nets(&["10.0.0.0/8"]))
        .await
        .unwrap();
    engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.5.0.0/16", "10.5.5.0/24"]))
        .await
        .unwrap();
    observe_in(&store, "10.5.5.5", "10.5.5.0/24").await;

    let outcome = engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.5.0.0/16"]))
        .await
        .unwrap();

    let ca = store.country_by_code(&code("CA")).await.unwrap().unwrap();
    assert_eq!(outcome.migrated.len(), 1);
    assert_eq!(outcome.migrated[0].to_block.country_id, ca.id);
    assert_eq!(outcome.migrated[0].to_block.network.to_string(), "10.0.0.0/8");
    assert_no_dangling(&store).await;
}

#[tokio::test]
async fn missing_sentinel_is_a_consistency_error_and_writes_nothing() {
    let store = seeded_store(&["US"]).await;
    let engine = reconciler(Arc::new(store.clone()));
    let us = code("US");

    engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.0.0.0/8"]))
        .await
        .unwrap();
    observe_in(&store, "10.5.5.5", "10.0.0.0/8").await;

    let result = engine
        .reconcile(&us, AddressFamily::V4, &nets(&["12.0.0.0/8"]))
        .await;
    assert!(matches!(result, Err(Error::Consistency(_))));

    // Neither phase ran
    assert_eq!(
        stored_set(&store, "US", AddressFamily::V4).await,
        nets(&["10.0.0.0/8"])
    );
    assert_no_dangling(&store).await;
}

#[tokio::test]
async fn block_transfer_between_countries() {
    let store = seeded_store(&["CA", "US", "ZZ"]).await;
    let engine = reconciler(Arc::new(store.clone()));

    engine
        .reconcile(&code("US"), AddressFamily::V4, &nets(&["24.0.0.0/8"]))
        .await
        .unwrap();
    observe_in(&store, "24.1.1.1", "24.0.0.0/8").await;

    // CA picks the block up before US drops it, as a run in code order does
    engine
        .reconcile(&code("CA"), AddressFamily::V4, &nets(&["24.0.0.0/8"]))
        .await
        .unwrap();
    let outcome = engine
        .reconcile(&code("US"), AddressFamily::V4, &nets(&[]))
        .await
        .unwrap();

    let ca = store.country_by_code(&code("CA")).await.unwrap().unwrap();
    assert_eq!(outcome.migrated.len(), 1);
    assert_eq!(outcome.migrated[0].to_block.country_id, ca.id);
    assert_eq!(outcome.migrated[0].to_block.network.to_string(), "24.0.0.0/8");
    assert_no_dangling(&store).await;
}

#[tokio::test]
async fn run_leaves_unlisted_countries_untouched() {
    let store = seeded_store(&["GB", "US", "ZZ"]).await;
    let engine = reconciler(Arc::new(store.clone()));

    engine
        .reconcile(&code("GB"), AddressFamily::V4, &nets(&["2.0.0.0/8"]))
        .await
        .unwrap();

    let source = StaticSnapshotSource::new()
        .with_blocks(AddressFamily::V4, "US", &["3.0.0.0/8"])
        .with_blocks(AddressFamily::V6, "US", &["2600::/12"]);
    let report = engine.run(&source).await;

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(report.total_added(), 2);
    assert_eq!(
        stored_set(&store, "GB", AddressFamily::V4).await,
        nets(&["2.0.0.0/8"])
    );
    assert_eq!(
        stored_set(&store, "US", AddressFamily::V6).await,
        nets(&["2600::/12"])
    );
}
