//! The check sequence.
//!
//! [`Checker::run`] executes, in order and stopping at the first failure:
//!
//! 1. mapping check: the index mapping has more than a minimum number of properties
//! 2. population check: enough submitters are indexed
//! 3. stale-sentinel cleanup
//! 4. round trip: create the sentinel, wait for the index to show it, delete
//!    it, wait for the index to drop it
//!
//! Cancellation is honoured between steps and abandons in-flight index reads.
//! Repository writes always run to completion; a sentinel created before
//! cancellation is deleted again before the run returns.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::config::CheckConfig;
use crate::error::{CheckError, Error, Result};
use crate::index::{MappingSource, mapping_property_count};
use crate::repository::{Repository, ResourceId, ResourceKind, Role, User};
use crate::wait::{CancelToken, PollPolicy, Probe, poll_until};

/// Attribute holding business identifiers.
pub const LOCATOR_ATTRIBUTE: &str = "locatorIds";

/// Attribute holding user roles.
pub const ROLES_ATTRIBUTE: &str = "roles";

/// Disposable user created and removed by every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    pub first_name: String,
    pub last_name: String,
    /// Business identifier the index is searched by
    pub locator_id: String,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self {
            first_name: "BeSsIe".to_string(),
            last_name: "MoOcOw".to_string(),
            locator_id: "infinity".to_string(),
        }
    }
}

impl Sentinel {
    #[must_use]
    pub fn user(&self) -> User {
        User::new(&self.first_name, &self.last_name).with_locator_id(&self.locator_id)
    }
}

/// Thresholds and poll budget for one run.
#[derive(Debug, Clone)]
pub struct CheckSettings {
    pub min_mapping_properties: usize,
    pub min_submitters: usize,
    pub poll: PollPolicy,
    pub fail_on_stale_sentinel: bool,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self::from(&CheckConfig::default())
    }
}

impl From<&CheckConfig> for CheckSettings {
    fn from(config: &CheckConfig) -> Self {
        Self {
            min_mapping_properties: config.min_mapping_properties,
            min_submitters: config.min_submitters,
            poll: config.poll_policy(),
            fail_on_stale_sentinel: config.fail_on_stale_sentinel,
        }
    }
}

/// Outcome of a successful round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripReport {
    pub sentinel: ResourceId,
    /// Probe calls until the sentinel was visible
    pub appear_attempts: u32,
    /// Probe calls until the sentinel was gone
    pub disappear_attempts: u32,
    pub elapsed: Duration,
}

impl RoundTripReport {
    /// Poll sleeps taken across both waits.
    #[must_use]
    pub fn sleeps(&self) -> u32 {
        self.appear_attempts.saturating_sub(1) + self.disappear_attempts.saturating_sub(1)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub mapping_properties: usize,
    pub submitters: usize,
    /// Sentinel left by an earlier run and removed by this one
    pub stale_sentinel: Option<ResourceId>,
    pub round_trip: RoundTripReport,
    pub elapsed: Duration,
}

/// Runs the checks against a mapping source and a repository.
pub struct Checker<M, R> {
    mapping: M,
    repository: R,
    settings: CheckSettings,
    sentinel: Sentinel,
    cancel: CancelToken,
}

impl<M, R> Checker<M, R>
where
    M: MappingSource,
    R: Repository,
{
    #[must_use]
    pub fn new(mapping: M, repository: R, settings: CheckSettings, cancel: CancelToken) -> Self {
        Self {
            mapping,
            repository,
            settings,
            sentinel: Sentinel::default(),
            cancel,
        }
    }

    #[must_use]
    pub fn with_sentinel(mut self, sentinel: Sentinel) -> Self {
        self.sentinel = sentinel;
        self
    }

    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    #[must_use]
    pub fn settings(&self) -> &CheckSettings {
        &self.settings
    }

    /// Run every check in order.
    #[instrument(skip(self), fields(index = self.mapping.index_name()))]
    pub async fn run(&self) -> Result<CheckReport> {
        let start = Instant::now();
        let mapping_properties = self.check_mapping().await?;
        let submitters = self.check_population().await?;
        let stale_sentinel = self.clear_stale_sentinel().await?;
        let round_trip = self.round_trip().await?;
        Ok(CheckReport {
            mapping_properties,
            submitters,
            stale_sentinel,
            round_trip,
            elapsed: start.elapsed(),
        })
    }

    /// The mapping must have strictly more than `min_mapping_properties` properties.
    pub async fn check_mapping(&self) -> Result<usize> {
        let doc = self
            .interruptible("mapping check", self.mapping.fetch_mapping())
            .await?;
        let found = mapping_property_count(&doc, self.mapping.index_name())?;
        let minimum = self.settings.min_mapping_properties;
        if found <= minimum {
            return Err(CheckError::TooFewMappingProperties { found, minimum }.into());
        }
        info!(properties = found, "Index mapping check passed");
        Ok(found)
    }

    /// At least `min_submitters` users with the submitter role must be indexed.
    pub async fn check_population(&self) -> Result<usize> {
        let submitters = self
            .interruptible(
                "population check",
                self.repository.find_all_by_attribute(
                    ResourceKind::User,
                    ROLES_ATTRIBUTE,
                    Role::Submitter.as_str(),
                ),
            )
            .await?;
        let found = submitters.len();
        let minimum = self.settings.min_submitters;
        if found < minimum {
            return Err(CheckError::TooFewSubmitters { found, minimum }.into());
        }
        info!(submitters = found, "Index population check passed");
        Ok(found)
    }

    /// Remove a sentinel left behind by an earlier run.
    ///
    /// Returns `Ok(None)` when there is nothing to remove. After removing one
    /// the step fails with [`CheckError::StaleSentinel`] unless
    /// `fail_on_stale_sentinel` is off. A sentinel that stays indexed after
    /// deletion exhausts the poll and is fatal.
    pub async fn clear_stale_sentinel(&self) -> Result<Option<ResourceId>> {
        let Some(stale) = self.find_sentinel().await? else {
            return Ok(None);
        };

        warn!(id = %stale, "Found sentinel from an earlier run; removing it");
        self.repository.delete(&stale).await?;
        let polled = poll_until(
            &self.settings.poll,
            &self.cancel,
            "stale sentinel removed from index",
            || self.probe_absent(),
        )
        .await?;
        info!(id = %stale, attempts = polled.attempts, "Stale sentinel removed");

        if self.settings.fail_on_stale_sentinel {
            return Err(CheckError::StaleSentinel {
                id: stale.to_string(),
            }
            .into());
        }
        Ok(Some(stale))
    }

    /// Create the sentinel, see it indexed, delete it, see it gone.
    pub async fn round_trip(&self) -> Result<RoundTripReport> {
        let start = Instant::now();
        self.ensure_running("sentinel creation")?;
        let created = self
            .repository
            .create(&self.sentinel.user())
            .await?
            .ok_or(CheckError::SentinelNotCreated)?;
        info!(id = %created, "Created sentinel");

        let appeared = match poll_until(
            &self.settings.poll,
            &self.cancel,
            "sentinel visible in index",
            || self.probe_present(&created),
        )
        .await
        {
            Ok(polled) => polled,
            Err(e) => {
                let err = Error::from(e);
                if err.is_cancelled() {
                    self.discard(&created).await;
                }
                return Err(err);
            }
        };
        info!(id = %created, attempts = appeared.attempts, "Sentinel visible in index");

        self.repository.delete(&created).await?;
        info!(id = %created, "Deleted sentinel");

        let disappeared = poll_until(
            &self.settings.poll,
            &self.cancel,
            "sentinel removed from index",
            || self.probe_absent(),
        )
        .await?;
        info!(
            id = %created,
            attempts = disappeared.attempts,
            "Sentinel removed from index"
        );

        Ok(RoundTripReport {
            sentinel: created,
            appear_attempts: appeared.attempts,
            disappear_attempts: disappeared.attempts,
            elapsed: start.elapsed(),
        })
    }

    fn ensure_running(&self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(step, "Cancelled before step");
            return Err(Error::Cancelled(step.to_string()));
        }
        Ok(())
    }

    /// Await `work` unless cancellation arrives first.
    async fn interruptible<T>(
        &self,
        step: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.ensure_running(step)?;
        tokio::select! {
            result = work => result,
            () = self.cancel.cancelled() => {
                warn!(step, "Cancelled; abandoning request");
                Err(Error::Cancelled(step.to_string()))
            }
        }
    }

    /// Best-effort removal of a sentinel this run created.
    async fn discard(&self, id: &ResourceId) {
        match self.repository.delete(id).await {
            Ok(()) => info!(id = %id, "Removed sentinel after cancellation"),
            Err(e) => warn!(id = %id, error = %e, "Could not remove sentinel; the next run will"),
        }
    }

    async fn find_sentinel(&self) -> Result<Option<ResourceId>> {
        self.interruptible(
            "sentinel lookup",
            self.repository.find_by_attribute(
                ResourceKind::User,
                LOCATOR_ATTRIBUTE,
                &self.sentinel.locator_id,
            ),
        )
        .await
    }

    async fn probe_present(&self, expected: &ResourceId) -> Result<Probe<()>> {
        Ok(match self.find_sentinel().await? {
            Some(id) if &id == expected => Probe::Ready(()),
            Some(other) => Probe::not_ready(format!("found {other}")),
            None => Probe::not_ready("no match"),
        })
    }

    async fn probe_absent(&self) -> Result<Probe<()>> {
        Ok(match self.find_sentinel().await? {
            None => Probe::Ready(()),
            Some(id) => Probe::not_ready(format!("still indexed as {id}")),
        })
    }
}
