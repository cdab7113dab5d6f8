// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flotilla-core integration tests.
//!
//! Provides a Harness wiring an orchestrator to in-memory collaborators and a
//! manual clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use flotilla_core::cloud::MockCloud;
use flotilla_core::package::StaticPackageSource;
use flotilla_core::remote::MockConnector;
use flotilla_core::store::{FleetStateRepo, MemoryStateStore, StateStore};
use flotilla_core::{CloudSpec, FleetState, ManualClock, Orchestrator, PackageManager};

pub const FLEET: &str = "web";
pub const REVISION: &str = "3f2a9c0d1e4b5a6978877665544332211000ffee";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn spec(count: u32) -> CloudSpec {
    CloudSpec {
        instance_type: "t3.micro".to_string(),
        image_id: "ami-0abc1234".to_string(),
        desired_count: count,
        package_manager: PackageManager::Yum,
        remote_user: "ec2-user".to_string(),
        prerequisites: None,
    }
}

/// An orchestrator for fleet `web` plus handles on everything behind it.
pub struct Harness {
    pub store: Arc<dyn StateStore>,
    pub cloud: MockCloud,
    pub connector: MockConnector,
    pub clock: ManualClock,
    pub key_dir: TempDir,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MockCloud::new(), MockConnector::new())
    }

    pub fn with(cloud: MockCloud, connector: MockConnector) -> Self {
        Self::with_store(Arc::new(MemoryStateStore::new()), cloud, connector)
    }

    pub fn with_store(
        store: Arc<dyn StateStore>,
        cloud: MockCloud,
        connector: MockConnector,
    ) -> Self {
        let clock = ManualClock::new(start());
        let key_dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::builder()
            .fleet(FLEET)
            .store(store.clone())
            .cloud(Arc::new(cloud.clone()))
            .connector(Arc::new(connector.clone()))
            .packages(Arc::new(StaticPackageSource::new(
                "flotilla",
                b"\x7fELF-agent".to_vec(),
            )))
            .clock(Arc::new(clock.clone()))
            .max_repeat_delay(Duration::from_secs(10))
            .key_dir(key_dir.path())
            .build()
            .unwrap();

        Self {
            store,
            cloud,
            connector,
            clock,
            key_dir,
            orchestrator,
        }
    }

    pub fn repo(&self) -> FleetStateRepo {
        FleetStateRepo::new(self.store.clone(), FLEET)
    }

    pub async fn state(&self) -> FleetState {
        self.repo().load().await.unwrap()
    }

    /// Apply `spec(count)` and roll forward until converged.
    pub async fn converge(&self, count: u32) {
        self.orchestrator.apply_desired_spec(spec(count)).await.unwrap();
        let outcome = self.orchestrator.roll_forward().await.unwrap();
        assert!(outcome.is_converged(), "expected convergence, got {outcome:?}");
    }
}
