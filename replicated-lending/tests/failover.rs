//! Integration tests for replication and failover between two file-backed
//! storage engines.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use replicated_lending::model::{LoanStatus, demo_catalogue};
use replicated_lending::replication::{ReplicaState, ReplicationCoordinator};
use replicated_lending::store::StorageEngine;

/// Primary and secondary engines under one scratch directory.
struct TestPair {
    dir: tempfile::TempDir,
    coordinator: ReplicationCoordinator,
}

impl TestPair {
    fn open() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let primary = StorageEngine::open("primary", dir.path().join("primary"))?;
        let secondary = StorageEngine::open("secondary", dir.path().join("secondary"))?;
        primary.seed(demo_catalogue())?;
        secondary.seed(demo_catalogue())?;
        let coordinator = ReplicationCoordinator::new(Arc::new(primary), Arc::new(secondary))?;
        Ok(Self { dir, coordinator })
    }

    fn secondary_dir(&self) -> &Path {
        self.coordinator
            .secondary()
            .tables()
            .map(|tables| tables.dir())
            .unwrap_or_else(|| self.dir.path())
    }
}

#[test]
fn failover_is_sticky_even_after_primary_recovers() -> Result<()> {
    let pair = TestPair::open()?;
    let coordinator = &pair.coordinator;

    let loan = coordinator
        .grant_loan("U1", "L1", "2025-01-01", "2025-01-15")?
        .expect("L1 has copies");
    coordinator.flush_replication()?;

    coordinator.primary().set_available(false);
    assert!(coordinator.register_return(&loan.id).unwrap_err().is_unavailable());

    let outcome = coordinator.trigger_failover();
    assert!(outcome.performed);
    assert!(outcome.resynced);
    assert_eq!(coordinator.state(), ReplicaState::ActiveSecondary);

    coordinator.primary().set_available(true);
    assert!(coordinator.register_return(&loan.id)?);
    assert!(!coordinator.primary_active());

    // The write only reached the secondary.
    assert_eq!(coordinator.primary().loan(&loan.id).unwrap().status, LoanStatus::Active);
    assert_eq!(coordinator.primary().book("L1").unwrap().available_copies, 1);
    assert_eq!(coordinator.secondary().loan(&loan.id).unwrap().status, LoanStatus::Returned);
    assert_eq!(coordinator.secondary().book("L1").unwrap().available_copies, 2);
    Ok(())
}

#[test]
fn resync_rescues_writes_the_lane_missed() -> Result<()> {
    let pair = TestPair::open()?;
    let coordinator = &pair.coordinator;

    coordinator.secondary().set_available(false);
    let loan = coordinator
        .grant_loan("U1", "L2", "2025-01-01", "2025-01-15")?
        .expect("L2 has one copy");
    coordinator.flush_replication()?;
    assert_eq!(coordinator.replication_stats().failed, 1);
    coordinator.secondary().set_available(true);
    assert!(coordinator.secondary().loan(&loan.id).is_none());

    coordinator.primary().fail_after_writes(0);
    let outcome = coordinator.trigger_failover();
    assert!(outcome.resynced);

    let rescued = coordinator.secondary().loan(&loan.id).expect("copied from primary files");
    assert_eq!(rescued.user_id, "U1");
    assert_eq!(coordinator.secondary().book("L2").unwrap().available_copies, 0);
    assert!(coordinator.grant_loan("U2", "L2", "a", "b")?.is_none());
    Ok(())
}

#[test]
fn failed_resync_loses_unreplicated_writes_but_still_fails_over() -> Result<()> {
    let pair = TestPair::open()?;
    let coordinator = &pair.coordinator;

    coordinator.secondary().set_available(false);
    let loan = coordinator
        .grant_loan("U1", "L1", "a", "b")?
        .expect("L1 has copies");
    coordinator.flush_replication()?;
    coordinator.secondary().set_available(true);

    // Replace the secondary's directory with a plain file so the copy fails.
    let secondary_dir = pair.secondary_dir().to_path_buf();
    fs::remove_dir_all(&secondary_dir)?;
    fs::write(&secondary_dir, b"not a directory")?;

    let outcome = coordinator.trigger_failover();
    assert!(outcome.performed);
    assert!(!outcome.resynced);
    assert!(!coordinator.primary_active());
    assert!(coordinator.secondary().loan(&loan.id).is_none());
    assert_eq!(coordinator.secondary().book("L1").unwrap().available_copies, 2);
    Ok(())
}

#[test]
fn fault_plan_fires_after_configured_writes() -> Result<()> {
    let pair = TestPair::open()?;
    let coordinator = &pair.coordinator;
    coordinator.primary().fail_after_writes(2);

    let first = coordinator.grant_loan("U1", "L1", "a", "b")?.expect("first copy");
    assert!(coordinator.register_renewal(&first.id, "c")?);
    let err = coordinator.grant_loan("U2", "L1", "a", "b").unwrap_err();
    assert!(err.is_unavailable());

    coordinator.trigger_failover();
    let second = coordinator.grant_loan("U2", "L1", "a", "b")?.expect("secondary serves");
    assert_ne!(first.id, second.id);
    assert_eq!(coordinator.secondary().book("L1").unwrap().available_copies, 0);
    Ok(())
}
