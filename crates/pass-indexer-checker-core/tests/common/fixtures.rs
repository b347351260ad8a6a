//! Test fixtures: an in-memory repository whose index lags behind its
//! writes, and a mapping source serving a fixed document.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use pass_indexer_checker_core::check::{CheckSettings, Checker};
use pass_indexer_checker_core::error::{Error, IndexError};
use pass_indexer_checker_core::index::{IndexFuture, MappingSource};
use pass_indexer_checker_core::repository::{
    RepoFuture, Repository, ResourceId, ResourceKind, User,
};
use pass_indexer_checker_core::wait::{CancelToken, PollPolicy};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// StaticMapping
// ---------------------------------------------------------------------------

/// Serves a mapping document with `properties` fields under `pass`.
pub struct StaticMapping {
    doc: Value,
}

impl StaticMapping {
    #[must_use]
    pub fn with_properties(properties: usize) -> Self {
        let fields: serde_json::Map<String, Value> = (0..properties)
            .map(|i| (format!("field{i}"), json!({ "type": "keyword" })))
            .collect();
        Self {
            doc: json!({ "pass": { "mappings": { "_doc": { "properties": fields } } } }),
        }
    }
}

impl MappingSource for StaticMapping {
    fn index_name(&self) -> &str {
        "pass"
    }

    fn fetch_mapping(&self) -> IndexFuture<'_, Value> {
        let doc = self.doc.clone();
        Box::pin(async move { Ok(doc) })
    }
}

/// Mapping source whose request never completes.
pub struct HangingMapping;

impl MappingSource for HangingMapping {
    fn index_name(&self) -> &str {
        "pass"
    }

    fn fetch_mapping(&self) -> IndexFuture<'_, Value> {
        Box::pin(std::future::pending())
    }
}

// ---------------------------------------------------------------------------
// FakePass
// ---------------------------------------------------------------------------

/// Change waiting to reach the index.
#[derive(Debug, Clone)]
struct Pending {
    visible: Option<ResourceId>,
    lookups_left: u32,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    stored: BTreeSet<ResourceId>,
    indexed: Option<ResourceId>,
    pending: Option<Pending>,
    created: Vec<User>,
    deleted: Vec<ResourceId>,
    lookups: u32,
    transient_failures: u32,
}

/// In-memory repository whose sentinel lookups see each write only after
/// `lag` further lookups.
pub struct FakePass {
    submitters: usize,
    lag: u32,
    deletes_propagate: bool,
    assign_ids: bool,
    state: Mutex<State>,
}

impl FakePass {
    #[must_use]
    pub fn new(submitters: usize, lag: u32) -> Self {
        Self {
            submitters,
            lag,
            deletes_propagate: true,
            assign_ids: true,
            state: Mutex::new(State::default()),
        }
    }

    /// A sentinel from an earlier run, already stored and indexed.
    #[must_use]
    pub fn with_stale(self, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let id = ResourceId::new(id);
            state.stored.insert(id.clone());
            state.indexed = Some(id);
        }
        self
    }

    /// Deletes succeed but never reach the index.
    #[must_use]
    pub fn with_stuck_deletes(mut self) -> Self {
        self.deletes_propagate = false;
        self
    }

    /// Creates succeed without reporting an id.
    #[must_use]
    pub fn without_ids(mut self) -> Self {
        self.assign_ids = false;
        self
    }

    /// The next `count` sentinel lookups fail with a 503.
    #[must_use]
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.state.lock().unwrap().transient_failures = count;
        self
    }

    pub fn created(&self) -> Vec<User> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<ResourceId> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn stored(&self) -> BTreeSet<ResourceId> {
        self.state.lock().unwrap().stored.clone()
    }

    pub fn lookups(&self) -> u32 {
        self.state.lock().unwrap().lookups
    }

    fn lookup(&self) -> Result<Option<ResourceId>, Error> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.lookups += 1;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(IndexError::Status {
                url: "http://es.test/pass/_search".to_string(),
                status: 503,
            }
            .into());
        }
        let arrived = match state.pending.as_mut() {
            Some(pending) if pending.lookups_left == 0 => true,
            Some(pending) => {
                pending.lookups_left -= 1;
                false
            }
            None => false,
        };
        if arrived {
            if let Some(pending) = state.pending.take() {
                state.indexed = pending.visible;
            }
        }
        Ok(state.indexed.clone())
    }
}

impl Repository for FakePass {
    fn create<'a>(&'a self, user: &'a User) -> RepoFuture<'a, Option<ResourceId>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.created.push(user.clone());
            if self.assign_ids {
                state.next_id += 1;
                let id = ResourceId::new(format!("http://fcrepo.test/rest/users/{}", state.next_id));
                state.stored.insert(id.clone());
                state.pending = Some(Pending {
                    visible: Some(id.clone()),
                    lookups_left: self.lag,
                });
                Some(id)
            } else {
                None
            }
        };
        Box::pin(async move { Ok(result) })
    }

    fn delete<'a>(&'a self, id: &'a ResourceId) -> RepoFuture<'a, ()> {
        {
            let mut state = self.state.lock().unwrap();
            state.stored.remove(id);
            state.deleted.push(id.clone());
            if self.deletes_propagate {
                state.pending = Some(Pending {
                    visible: None,
                    lookups_left: self.lag,
                });
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn find_by_attribute<'a>(
        &'a self,
        kind: ResourceKind,
        attribute: &'a str,
        value: &'a str,
    ) -> RepoFuture<'a, Option<ResourceId>> {
        assert_eq!(kind, ResourceKind::User);
        assert_eq!((attribute, value), ("locatorIds", "infinity"));
        let result = self.lookup();
        Box::pin(async move { result })
    }

    fn find_all_by_attribute<'a>(
        &'a self,
        kind: ResourceKind,
        attribute: &'a str,
        value: &'a str,
    ) -> RepoFuture<'a, BTreeSet<ResourceId>> {
        assert_eq!(kind, ResourceKind::User);
        assert_eq!((attribute, value), ("roles", "submitter"));
        let ids = (0..self.submitters)
            .map(|i| ResourceId::new(format!("http://fcrepo.test/rest/users/s{i}")))
            .collect();
        Box::pin(async move { Ok(ids) })
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Settings with the default thresholds and a short attempt budget.
#[must_use]
pub fn settings(max_attempts: u32) -> CheckSettings {
    CheckSettings {
        poll: PollPolicy::new(Duration::from_secs(3), max_attempts, None),
        ..CheckSettings::default()
    }
}

#[must_use]
pub fn checker(repo: FakePass, settings: CheckSettings) -> Checker<StaticMapping, FakePass> {
    Checker::new(
        StaticMapping::with_properties(25),
        repo,
        settings,
        CancelToken::never(),
    )
}
