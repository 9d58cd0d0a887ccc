//! Reconciliation engine
//!
//! The Reconciler is responsible for:
//! - Diffing a freshly published block set against the stored one
//! - Re-homing observed addresses whose block is about to disappear
//! - Writing deletions and insertions as two separate transactions
//! - Running full passes over every country and family, isolating failures
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐
//! │ SnapshotSource │─── Snapshot (per family) ───┐
//! └────────────────┘                             │
//!                                                ▼
//!                                       ┌──────────────┐
//!                                       │  Reconciler  │
//!                                       └──────────────┘
//!                                                │
//!                 ┌──────────────────────────────┼───────────────────┐
//!                 │                              │                   │
//!                 ▼                              ▼                   ▼
//!        ┌─────────────────┐         ┌────────────────────┐   ┌─────────────┐
//!        │ BlockStore      │         │ BlockStore         │   │   Events    │
//!        │ (diff, covers)  │         │ (removals, inserts)│   │  (notify)   │
//!        └─────────────────┘         └────────────────────┘   └─────────────┘
//! ```
//!
//! ## Unit Flow
//!
//! One unit is one (country, family) pair:
//!
//! 1. Load the stored blocks of the unit
//! 2. `added = new - current`, `removed = current - new`
//! 3. Plan a new home for every address pointing into `removed`: another
//!    country's covering block, else the sentinel catch-all
//! 4. Transaction 1: migrate those addresses, delete `removed`
//! 5. Transaction 2: insert `added`
//!
//! Units are independent. A failed unit is recorded and the run moves on.

use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{
    host_net, select_cover, AddressFamily, Block, BlockId, Country, CountryCode, Snapshot,
};
use crate::traits::{
    AddressMigration, BlockStore, MigrationTarget, PlannedMigration, RemovalPlan, SnapshotSource,
};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events emitted by the Reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// Full run started
    Started { families: Vec<AddressFamily> },

    /// A family's snapshot could not be fetched; nothing was written for it
    FetchFailed {
        family: AddressFamily,
        error: String,
    },

    /// One unit was brought in line with its snapshot
    UnitReconciled {
        country: CountryCode,
        family: AddressFamily,
        added: usize,
        removed: usize,
        migrated: usize,
    },

    /// One unit failed; the run continues with the next
    UnitFailed {
        country: CountryCode,
        family: AddressFamily,
        error: String,
    },

    /// Full run finished
    Finished { reconciled: usize, failed: usize },
}

/// Result of reconciling one (country, family) unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub country: CountryCode,
    pub family: AddressFamily,
    /// Blocks inserted, with their new ids
    pub added: Vec<Block>,
    /// Blocks deleted, as they were stored
    pub removed: Vec<Block>,
    /// Addresses re-homed away from deleted blocks
    pub migrated: Vec<AddressMigration>,
}

impl ReconcileOutcome {
    /// Whether the unit was already in sync
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Counts-only view for reports
    pub fn summary(&self) -> UnitSummary {
        UnitSummary {
            country: self.country,
            family: self.family,
            added: self.added.len(),
            removed: self.removed.len(),
            migrated: self.migrated.len(),
        }
    }
}

/// Counts for one reconciled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub country: CountryCode,
    pub family: AddressFamily,
    pub added: usize,
    pub removed: usize,
    pub migrated: usize,
}

/// A unit (or a whole family, when `country` is `None`) that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub country: Option<CountryCode>,
    pub family: AddressFamily,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of a full run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitSummary>,
    pub failures: Vec<UnitFailure>,
}

impl RunReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            units: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Whether every unit and every fetch succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total blocks inserted
    pub fn total_added(&self) -> usize {
        self.units.iter().map(|u| u.added).sum()
    }

    /// Total blocks deleted
    pub fn total_removed(&self) -> usize {
        self.units.iter().map(|u| u.removed).sum()
    }

    /// Total addresses re-homed
    pub fn total_migrated(&self) -> usize {
        self.units.iter().map(|u| u.migrated).sum()
    }

    fn absorb(&mut self, other: RunReport) {
        self.units.extend(other.units);
        self.failures.extend(other.failures);
    }
}

/// Core reconciliation engine
///
/// ## Lifecycle
///
/// 1. Create with [`Reconciler::new()`]
/// 2. Call [`Reconciler::run()`] for a full pass, or
///    [`Reconciler::reconcile()`] for a single unit
///
/// ## Concurrency
///
/// Units run one after another. Two reconcilers working on the same unit at
/// the same time is a caller error and must be prevented outside this crate.
pub struct Reconciler {
    /// Block store holding the state of record
    store: Arc<dyn BlockStore>,

    /// Deadline for one family's snapshot fetch
    fetch_timeout: Duration,

    /// Families processed by a full run
    families: Vec<AddressFamily>,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<ReconcileEvent>,
}

impl Reconciler {
    /// Create a new reconciler
    ///
    /// # Returns
    ///
    /// A tuple of (reconciler, event_receiver) where event_receiver yields
    /// reconciliation events
    pub fn new(
        store: Arc<dyn BlockStore>,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<ReconcileEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let reconciler = Self {
            store,
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            families: config.families,
            event_tx: tx,
        };

        Ok((reconciler, rx))
    }

    /// The store this reconciler writes to
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Bring one (country, family) unit in line with `new_blocks`
    ///
    /// `new_blocks` is the complete published set for the unit. Afterwards the
    /// stored set equals it exactly and no observed address points at a
    /// deleted block.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidInput` if a block is not of `family`
    /// - `Error::UnknownCountry` if `code` was never seeded
    /// - `Error::Consistency` if an address has no cover and the sentinel
    ///   country is missing; nothing is written in that case
    /// - storage errors from either transaction
    pub async fn reconcile(
        &self,
        code: &CountryCode,
        family: AddressFamily,
        new_blocks: &BTreeSet<IpNet>,
    ) -> Result<ReconcileOutcome> {
        if let Some(stray) = new_blocks
            .iter()
            .find(|net| AddressFamily::of_net(net) != family)
        {
            return Err(Error::invalid_input(format!(
                "{} published for {} is not an {} network",
                stray, code, family
            )));
        }

        let country = self
            .store
            .country_by_code(code)
            .await?
            .ok_or_else(|| Error::unknown_country(code.as_str()))?;

        // The sentinel's catch-all is managed here, never by a snapshot
        let catch_all = family.catch_all();
        let shielded = |net: &IpNet| code.is_sentinel() && *net == catch_all;

        let current: BTreeMap<IpNet, Block> = self
            .store
            .blocks_for(country.id, family)
            .await?
            .into_iter()
            .filter(|b| !shielded(&b.network))
            .map(|b| (b.network, b))
            .collect();

        let added: Vec<IpNet> = new_blocks
            .iter()
            .filter(|net| !current.contains_key(*net) && !shielded(*net))
            .copied()
            .collect();
        let removed: Vec<Block> = current
            .values()
            .filter(|b| !new_blocks.contains(&b.network))
            .cloned()
            .collect();

        debug!(
            "Diffing {} {}: {} stored, {} published, {} added, {} removed",
            code,
            family,
            current.len(),
            new_blocks.len(),
            added.len(),
            removed.len()
        );

        let mut outcome = ReconcileOutcome {
            country: *code,
            family,
            added: Vec::new(),
            removed: Vec::new(),
            migrated: Vec::new(),
        };

        if added.is_empty() && removed.is_empty() {
            return Ok(outcome);
        }

        if !removed.is_empty() {
            let plan = self.plan_removals(&country, family, &removed).await?;
            debug!(
                "Committing {} deletions and {} migrations for {} {}",
                plan.deletions.len(),
                plan.migrations.len(),
                code,
                family
            );
            outcome.migrated = self.store.apply_removals(&plan).await?;
            outcome.removed = removed;
        }

        if !added.is_empty() {
            debug!("Committing {} additions for {} {}", added.len(), code, family);
            outcome.added = self.store.apply_insertions(country.id, &added).await?;
        }

        info!(
            "{} {}: {} blocks added, {} removed, {} addresses migrated",
            code,
            family,
            outcome.added.len(),
            outcome.removed.len(),
            outcome.migrated.len()
        );

        Ok(outcome)
    }

    /// Work out where every address in a removed block goes
    ///
    /// Candidates are stored blocks of other countries that cover the
    /// address; [`select_cover`] picks among them. A surviving block of the
    /// unit's own country never qualifies. Addresses with no candidate go to
    /// the sentinel's catch-all.
    async fn plan_removals(
        &self,
        country: &Country,
        family: AddressFamily,
        removed: &[Block],
    ) -> Result<RemovalPlan> {
        let removed_ids: Vec<BlockId> = removed.iter().map(|b| b.id).collect();
        let dependents = self.store.addresses_in_blocks(&removed_ids).await?;

        let mut sentinel: Option<Country> = None;
        let mut migrations = Vec::with_capacity(dependents.len());

        for address in dependents {
            let covers = self.store.covering_blocks(&host_net(address.address)).await?;
            let survivor = select_cover(covers.iter().filter(|b| b.country_id != country.id));

            let target = match survivor {
                Some(block) => {
                    debug!(
                        "Re-homing {} from block {} to {} (block {})",
                        address.address, address.block_id, block.network, block.id
                    );
                    MigrationTarget::Block(block.id)
                }
                None => {
                    if sentinel.is_none() {
                        sentinel = self.store.country_by_code(&CountryCode::SENTINEL).await?;
                    }
                    let Some(zz) = sentinel.as_ref() else {
                        return Err(Error::consistency(format!(
                            "address {} in {} {} has no remaining cover and sentinel country {} does not exist",
                            address.address,
                            country.code,
                            family,
                            CountryCode::SENTINEL
                        )));
                    };
                    debug!(
                        "Re-homing {} from block {} to the {} catch-all",
                        address.address, address.block_id, CountryCode::SENTINEL
                    );
                    MigrationTarget::Sentinel {
                        country_id: zz.id,
                        family,
                    }
                }
            };

            migrations.push(PlannedMigration {
                address_id: address.id,
                from_block: address.block_id,
                target,
            });
        }

        Ok(RemovalPlan {
            migrations,
            deletions: removed_ids,
        })
    }

    /// Reconcile every country present in a snapshot
    ///
    /// Countries are processed in code order. Failures are recorded in the
    /// report rather than returned; countries absent from the snapshot are
    /// left untouched.
    pub async fn reconcile_snapshot(&self, snapshot: &Snapshot) -> RunReport {
        let mut report = RunReport::begin();
        let family = snapshot.family();

        for (code, blocks) in snapshot.iter() {
            match self.reconcile(code, family, blocks).await {
                Ok(outcome) => {
                    let summary = outcome.summary();
                    self.emit_event(ReconcileEvent::UnitReconciled {
                        country: *code,
                        family,
                        added: summary.added,
                        removed: summary.removed,
                        migrated: summary.migrated,
                    });
                    report.units.push(summary);
                }
                Err(e) => {
                    error!("Failed to reconcile {} {}: {}", code, family, e);
                    self.emit_event(ReconcileEvent::UnitFailed {
                        country: *code,
                        family,
                        error: e.to_string(),
                    });
                    report.failures.push(UnitFailure {
                        country: Some(*code),
                        family,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        report.finished_at = Utc::now();
        report
    }

    /// Run a full pass over every configured family
    ///
    /// Each family's snapshot is fetched under the configured deadline
    /// before anything is written; a failed or timed-out fetch skips that
    /// family entirely.
    pub async fn run(&self, source: &dyn SnapshotSource) -> RunReport {
        let mut report = RunReport::begin();

        self.emit_event(ReconcileEvent::Started {
            families: self.families.clone(),
        });

        for family in self.families.iter().copied() {
            info!("Fetching {} snapshot from {}", family, source.source_name());

            let fetched = match tokio::time::timeout(
                self.fetch_timeout,
                source.fetch_snapshot(family),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!(
                    "{} snapshot fetch exceeded {:?}",
                    family, self.fetch_timeout
                ))),
            };

            match fetched {
                Ok(snapshot) => {
                    info!(
                        "Fetched {} snapshot: {} countries, {} blocks",
                        family,
                        snapshot.country_count(),
                        snapshot.block_count()
                    );
                    report.absorb(self.reconcile_snapshot(&snapshot).await);
                }
                Err(e) => {
                    warn!("Skipping {} reconciliation, fetch failed: {}", family, e);
                    self.emit_event(ReconcileEvent::FetchFailed {
                        family,
                        error: e.to_string(),
                    });
                    report.failures.push(UnitFailure {
                        country: None,
                        family,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        report.finished_at = Utc::now();

        info!(
            "Run complete: {} units, {} added, {} removed, {} migrated, {} failures",
            report.units.len(),
            report.total_added(),
            report.total_removed(),
            report.total_migrated(),
            report.failures.len()
        );

        self.emit_event(ReconcileEvent::Finished {
            reconciled: report.units.len(),
            failed: report.failures.len(),
        });

        report
    }

    /// Emit a reconciliation event
    fn emit_event(&self, event: ReconcileEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}
