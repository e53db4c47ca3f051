//! Generic optimistic cache.
//!
//! Visible state is always `base` with every outstanding optimistic update
//! applied in the order the updates were created. The base is only replaced
//! by authoritative data: fetch responses and confirmed updates. A confirmed
//! update is folded into the base once every update created before it has
//! settled, so patches are never reordered.

use crate::error::ErrorKind;
use crate::store::{Store, StoreHandle};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Domain plugged into a [`CacheStore`].
pub trait CacheModel: Send + Sync + 'static {
    type Entities: Clone + Default + PartialEq + Send + Sync + 'static;
    type Patch: Clone + Send + Sync + 'static;
    type Fetched: Send + 'static;

    fn apply(entities: &mut Self::Entities, patch: &Self::Patch);

    fn merge(entities: &mut Self::Entities, fetched: Self::Fetched);

    /// Short name used in logs and errors.
    fn patch_kind(patch: &Self::Patch) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("query {key} failed: {message}")]
    QueryFailed { key: String, message: String },
    #[error("{kind} rejected: {message}")]
    MutationRejected { kind: &'static str, message: String },
    #[error("unknown {entity} {id}")]
    UnknownEntity { entity: &'static str, id: String },
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::QueryFailed { .. } => ErrorKind::QueryFailed,
            CacheError::MutationRejected { .. } => ErrorKind::MutationRejected,
            CacheError::UnknownEntity { .. } => ErrorKind::Integrity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryState {
    pub is_loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Pending,
    /// Confirmed but waiting for an earlier update to settle.
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct OptimisticUpdate<P> {
    pub id: Uuid,
    pub kind: &'static str,
    pub patch: P,
    pub created_at: DateTime<Utc>,
    pub status: UpdateStatus,
}

/// Published snapshot of a cache.
#[derive(Clone)]
pub struct CacheView<E, P> {
    /// Base entities with every optimistic update applied.
    pub entities: Arc<E>,
    pub queries: BTreeMap<String, QueryState>,
    pub updates: Vec<OptimisticUpdate<P>>,
}

impl<E, P> CacheView<E, P> {
    pub fn query(&self, key: &str) -> QueryState {
        self.queries.get(key).cloned().unwrap_or_default()
    }

    pub fn has_pending_updates(&self) -> bool {
        !self.updates.is_empty()
    }
}

pub type QueryFuture = Shared<BoxFuture<'static, Result<(), CacheError>>>;

struct InFlight {
    seq: u64,
    future: QueryFuture,
}

struct Inner<M: CacheModel> {
    base: Arc<M::Entities>,
    updates: Vec<OptimisticUpdate<M::Patch>>,
    queries: BTreeMap<String, QueryState>,
    in_flight: HashMap<String, InFlight>,
    /// Last fetch sequence issued / applied, per query key.
    issued: HashMap<String, u64>,
    applied: HashMap<String, u64>,
    revision: u64,
}

impl<M: CacheModel> Inner<M> {
    fn view(&self) -> CacheView<M::Entities, M::Patch> {
        let entities = if self.updates.is_empty() {
            self.base.clone()
        } else {
            let mut entities = (*self.base).clone();
            for update in &self.updates {
                M::apply(&mut entities, &update.patch);
            }
            Arc::new(entities)
        };
        CacheView {
            entities,
            queries: self.queries.clone(),
            updates: self.updates.clone(),
        }
    }

    /// Fold confirmed updates at the front of the queue into the base.
    fn promote(&mut self) {
        let settled = self
            .updates
            .iter()
            .take_while(|u| u.status == UpdateStatus::Confirmed)
            .count();
        if settled == 0 {
            return;
        }
        let base = Arc::make_mut(&mut self.base);
        for update in self.updates.drain(..settled) {
            M::apply(base, &update.patch);
        }
    }
}

pub struct CacheStore<M: CacheModel> {
    inner: Arc<Mutex<Inner<M>>>,
    store: Arc<Store<CacheView<M::Entities, M::Patch>>>,
}

impl<M: CacheModel> Clone for CacheStore<M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), store: self.store.clone() }
    }
}

impl<M: CacheModel> Default for CacheStore<M> {
    fn default() -> Self {
        Self::new(M::Entities::default())
    }
}

impl<M: CacheModel> CacheStore<M> {
    pub fn new(base: M::Entities) -> Self {
        let inner = Inner::<M> {
            base: Arc::new(base),
            updates: Vec::new(),
            queries: BTreeMap::new(),
            in_flight: HashMap::new(),
            issued: HashMap::new(),
            applied: HashMap::new(),
            revision: 0,
        };
        let store = Store::new(inner.view());
        Self { inner: Arc::new(Mutex::new(inner)), store: Arc::new(store) }
    }

    pub fn handle(&self) -> StoreHandle<CacheView<M::Entities, M::Patch>> {
        self.store.handle()
    }

    pub fn get_snapshot(&self) -> Arc<CacheView<M::Entities, M::Patch>> {
        self.store.get_snapshot()
    }

    /// Visible entities.
    pub fn entities(&self) -> Arc<M::Entities> {
        self.get_snapshot().entities.clone()
    }

    /// Last authoritative entities, without optimistic updates.
    pub fn base(&self) -> Arc<M::Entities> {
        self.lock().base.clone()
    }

    pub fn query_state(&self, key: &str) -> QueryState {
        self.lock().queries.get(key).cloned().unwrap_or_default()
    }

    /// Fetch `key` unless a fetch for it is already running, in which case
    /// the running one is joined.
    ///
    /// `fetcher` runs on the first poll of the returned future; every caller
    /// joining it may poll it.
    pub fn query<F, Fut, E>(&self, key: &str, fetcher: F) -> QueryFuture
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<M::Fetched, E>> + Send + 'static,
        E: Display + Send,
    {
        let (future, revision, view) = {
            let mut inner = self.lock();
            if let Some(running) = inner.in_flight.get(key) {
                debug!("query {key}: joining in-flight fetch #{}", running.seq);
                return running.future.clone();
            }
            self.start_fetch(&mut inner, key, fetcher)
        };
        self.store.publish(revision, view);
        future
    }

    /// Fetch `key` even if a fetch is already running. Responses of older
    /// fetches arriving afterwards are discarded.
    pub fn refetch<F, Fut, E>(&self, key: &str, fetcher: F) -> QueryFuture
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<M::Fetched, E>> + Send + 'static,
        E: Display + Send,
    {
        let (future, revision, view) = {
            let mut inner = self.lock();
            self.start_fetch(&mut inner, key, fetcher)
        };
        self.store.publish(revision, view);
        future
    }

    /// Apply `patch` to the visible state now, then run `request`.
    ///
    /// On success the patch becomes part of the base; on failure it is
    /// dropped and the visible state reverts. Other outstanding updates are
    /// unaffected either way. Dropping the returned future before it
    /// completes abandons the request and rolls the patch back.
    pub fn mutate<F, Fut, T, E>(&self, patch: M::Patch, request: F) -> BoxFuture<'static, Result<T, CacheError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send,
    {
        let id = Uuid::new_v4();
        let kind = M::patch_kind(&patch);
        self.update(|inner| {
            inner.updates.push(OptimisticUpdate {
                id,
                kind,
                patch,
                created_at: Utc::now(),
                status: UpdateStatus::Pending,
            });
        });

        let settlement = Settlement { cache: Some(self.clone()), id, kind };
        let response = request();
        async move {
            match response.await {
                Ok(value) => {
                    settlement.finish(true);
                    Ok(value)
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!("{kind} rejected, rolling back: {message}");
                    settlement.finish(false);
                    Err(CacheError::MutationRejected { kind, message })
                }
            }
        }
        .boxed()
    }

    fn start_fetch<F, Fut, E>(
        &self,
        inner: &mut Inner<M>,
        key: &str,
        fetcher: F,
    ) -> (QueryFuture, u64, CacheView<M::Entities, M::Patch>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<M::Fetched, E>> + Send + 'static,
        E: Display + Send,
    {
        let seq = {
            let issued = inner.issued.entry(key.to_string()).or_insert(0);
            *issued += 1;
            *issued
        };
        let this = self.clone();
        let owned_key = key.to_string();
        let future = async move {
            let result = fetcher().await.map_err(|e| e.to_string());
            this.finish_fetch(&owned_key, seq, result)
        }
        .boxed()
        .shared();
        inner
            .in_flight
            .insert(key.to_string(), InFlight { seq, future: future.clone() });
        inner.queries.insert(key.to_string(), QueryState { is_loading: true, error: None });
        inner.revision += 1;
        (future, inner.revision, inner.view())
    }

    fn finish_fetch(&self, key: &str, seq: u64, result: Result<M::Fetched, String>) -> Result<(), CacheError> {
        let mut outcome = Ok(());
        let published = {
            let mut inner = self.lock();
            if inner.in_flight.get(key).is_some_and(|f| f.seq == seq) {
                inner.in_flight.remove(key);
            }
            let applied = inner.applied.get(key).copied().unwrap_or(0);
            if seq < applied {
                debug!("query {key}: dropping response #{seq}, #{applied} is newer");
                return Ok(());
            }
            inner.applied.insert(key.to_string(), seq);
            let latest = inner.issued.get(key).copied().unwrap_or(seq) == seq;

            match result {
                Ok(fetched) => {
                    M::merge(Arc::make_mut(&mut inner.base), fetched);
                    if latest {
                        inner.queries.insert(key.to_string(), QueryState::default());
                    }
                }
                Err(message) => {
                    warn!("query {key} failed: {message}");
                    if latest {
                        inner.queries.insert(
                            key.to_string(),
                            QueryState { is_loading: false, error: Some(message.clone()) },
                        );
                    }
                    outcome = Err(CacheError::QueryFailed { key: key.to_string(), message });
                }
            }
            inner.revision += 1;
            (inner.revision, inner.view())
        };
        self.store.publish(published.0, published.1);
        outcome
    }

    fn settle(&self, id: Uuid, success: bool) {
        self.update(|inner| {
            let Some(idx) = inner.updates.iter().position(|u| u.id == id) else {
                return;
            };
            if success {
                inner.updates[idx].status = UpdateStatus::Confirmed;
                inner.promote();
            } else {
                inner.updates.remove(idx);
                // A rollback can unblock confirmed updates queued behind it.
                inner.promote();
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut Inner<M>)) {
        let (revision, view) = {
            let mut inner = self.lock();
            f(&mut inner);
            inner.revision += 1;
            (inner.revision, inner.view())
        };
        self.store.publish(revision, view);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rolls an optimistic update back unless its request settled first.
struct Settlement<M: CacheModel> {
    cache: Option<CacheStore<M>>,
    id: Uuid,
    kind: &'static str,
}

impl<M: CacheModel> Settlement<M> {
    fn finish(mut self, success: bool) {
        if let Some(cache) = self.cache.take() {
            cache.settle(self.id, success);
        }
    }
}

impl<M: CacheModel> Drop for Settlement<M> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            debug!("{} abandoned before settling, rolling back", self.kind);
            cache.settle(self.id, false);
        }
    }
}
