//! Contract Test: SQL Block Store on SQLite
//!
//! Constraints verified:
//! - Integrity rules match the in-memory store (uniqueness, references)
//! - Containment queries on byte ranges find every covering block
//! - A failed removal transaction rolls back completely
//! - The reconciler and lookup service behave the same on SQL
//!
//! If this test fails, the persisted database diverges from the engine's model.

use ipdeny_core::model::{AddressFamily, CountryCode, NewCountry};
use ipdeny_core::traits::{BlockStore, MigrationTarget, PlannedMigration, RemovalPlan};
use ipdeny_core::{EngineConfig, Error, Lookup, Reconciler};
use ipdeny_store_sql::SqlBlockStore;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tempfile::TempDir;

async fn open() -> (SqlBlockStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("ipdeny.db").display());
    let store = SqlBlockStore::connect(&url).await.unwrap();
    (store, dir)
}

async fn seed(store: &SqlBlockStore, codes: &[&str]) {
    let rows: Vec<NewCountry> = codes
        .iter()
        .map(|c| NewCountry::new(c, &format!("COUNTRY {}", c)).unwrap())
        .collect();
    store.insert_countries(&rows).await.unwrap();
}

fn code(raw: &str) -> CountryCode {
    CountryCode::parse(raw).unwrap()
}

fn nets(cidrs: &[&str]) -> BTreeSet<IpNet> {
    cidrs.iter().map(|c| c.parse().unwrap()).collect()
}

#[tokio::test]
async fn schema_is_idempotent_and_countries_unique() {
    let (store, _dir) = open().await;
    store.ensure_schema().await.unwrap();
    store.ensure_schema().await.unwrap();

    seed(&store, &["US", "ZZ"]).await;
    let again = store
        .insert_countries(&[
            NewCountry::new("FR", "FRANCE").unwrap(),
            NewCountry::new("US", "UNITED STATES").unwrap(),
        ])
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));

    let codes: Vec<String> = store
        .list_countries()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.code.to_string())
        .collect();
    assert_eq!(codes, vec!["US", "ZZ"]);
}

#[tokio::test]
async fn covering_blocks_compare_byte_ranges() {
    let (store, _dir) = open().await;
    seed(&store, &["US"]).await;
    let us = store.country_by_code(&code("US")).await.unwrap().unwrap();

    store
        .apply_insertions(
            us.id,
            &[
                "10.0.0.0/8".parse().unwrap(),
                "10.5.0.0/16".parse().unwrap(),
                "2001:db8::/32".parse().unwrap(),
            ],
        )
        .await
        .unwrap();

    let host: IpNet = "10.5.255.255/32".parse().unwrap();
    let covers: Vec<String> = store
        .covering_blocks(&host)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.network.to_string())
        .collect();
    assert_eq!(covers, vec!["10.0.0.0/8", "10.5.0.0/16"]);

    let v6: IpNet = "2001:db8:ffff::1/128".parse().unwrap();
    assert_eq!(store.covering_blocks(&v6).await.unwrap().len(), 1);

    let outside: IpNet = "11.0.0.0/32".parse().unwrap();
    assert!(store.covering_blocks(&outside).await.unwrap().is_empty());

    assert_eq!(store.blocks_for(us.id, AddressFamily::V4).await.unwrap().len(), 2);
    assert_eq!(store.blocks_for(us.id, AddressFamily::V6).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_removal_rolls_back() {
    let (store, _dir) = open().await;
    seed(&store, &["US", "ZZ"]).await;
    let us = store.country_by_code(&code("US")).await.unwrap().unwrap();
    let zz = store.country_by_code(&code("ZZ")).await.unwrap().unwrap();

    let blocks = store
        .apply_insertions(us.id, &["10.0.0.0/8".parse().unwrap()])
        .await
        .unwrap();
    let observed = store
        .insert_address("10.5.5.5".parse().unwrap(), blocks[0].id)
        .await
        .unwrap();

    let plan = RemovalPlan {
        migrations: vec![PlannedMigration {
            address_id: observed.id,
            from_block: blocks[0].id,
            target: MigrationTarget::Sentinel {
                country_id: zz.id,
                family: AddressFamily::V4,
            },
        }],
        deletions: vec![blocks[0].id, 9999],
    };
    assert!(matches!(store.apply_removals(&plan).await, Err(Error::NotFound(_))));

    // Neither the migration nor the catch-all survived
    let unchanged = store
        .address_by_value("10.5.5.5".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.block_id, blocks[0].id);
    assert!(store.blocks_for(zz.id, AddressFamily::V4).await.unwrap().is_empty());
}

#[tokio::test]
async fn referenced_block_is_refused() {
    let (store, _dir) = open().await;
    seed(&store, &["US"]).await;
    let us = store.country_by_code(&code("US")).await.unwrap().unwrap();
    let blocks = store
        .apply_insertions(us.id, &["10.0.0.0/8".parse().unwrap()])
        .await
        .unwrap();
    store
        .insert_address("10.1.1.1".parse().unwrap(), blocks[0].id)
        .await
        .unwrap();

    let plan = RemovalPlan {
        migrations: Vec::new(),
        deletions: vec![blocks[0].id],
    };
    assert!(matches!(store.apply_removals(&plan).await, Err(Error::Storage(_))));
    assert!(store.block_by_id(blocks[0].id).await.unwrap().is_some());

    assert!(matches!(
        store.insert_address("10.1.1.1".parse().unwrap(), blocks[0].id).await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        store.insert_address("10.2.2.2".parse().unwrap(), 4242).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn reconcile_and_lookup_on_sqlite() {
    let (store, _dir) = open().await;
    seed(&store, &["US", "ZZ"]).await;
    let store: Arc<dyn BlockStore> = Arc::new(store);
    let (engine, _rx) = Reconciler::new(store.clone(), EngineConfig::default()).unwrap();
    let lookup = Lookup::new(store.clone());
    let us = code("US");

    engine
        .reconcile(&us, AddressFamily::V4, &nets(&["10.0.0.0/8", "11.0.0.0/8"]))
        .await
        .unwrap();

    let address: IpAddr = "10.5.5.5".parse().unwrap();
    let observed = lookup.get_or_create_address(address).await.unwrap();

    let outcome = engine
        .reconcile(&us, AddressFamily::V4, &nets(&["11.0.0.0/8", "12.0.0.0/8"]))
        .await
        .unwrap();
    assert_eq!(outcome.added.len(), 1);
    assert_eq!(outcome.removed.len(), 1);
    assert_eq!(outcome.migrated.len(), 1);
    assert_eq!(outcome.migrated[0].address.id, observed.id);

    let country = lookup.country_of(address).await.unwrap().unwrap();
    assert!(country.code.is_sentinel());

    let second = engine
        .reconcile(&us, AddressFamily::V4, &nets(&["11.0.0.0/8", "12.0.0.0/8"]))
        .await
        .unwrap();
    assert!(second.is_noop());
}
