//! Comment threads and inbox notifications on top of [`CacheStore`].

use super::store::{CacheError, CacheModel, CacheStore, CacheView, QueryFuture};
use crate::store::StoreHandle;
use chrono::{DateTime, Utc};
use futures_util::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Query key of the inbox listing.
pub const INBOX_QUERY: &str = "inbox";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub thread_id: String,
    pub author_id: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn new(thread_id: impl Into<String>, author_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: format!("cm_{}", Uuid::new_v4().simple()),
            thread_id: thread_id.into(),
            author_id: author_id.into(),
            body: Some(body.into()),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub room_id: String,
    pub metadata: BTreeMap<String, Value>,
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Thread {
    /// A new thread whose first comment is `body`.
    pub fn new(room_id: impl Into<String>, author_id: impl Into<String>, body: impl Into<String>) -> Self {
        let id = format!("th_{}", Uuid::new_v4().simple());
        let first = Comment::new(id.clone(), author_id, body);
        Self {
            id,
            room_id: room_id.into(),
            metadata: BTreeMap::new(),
            created_at: first.created_at,
            updated_at: None,
            comments: vec![first],
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    fn live_comments(&self) -> usize {
        self.comments.iter().filter(|c| c.deleted_at.is_none()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxNotification {
    pub id: String,
    pub thread_id: String,
    pub notified_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl InboxNotification {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none_or(|read| read < self.notified_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboxEntities {
    pub threads: BTreeMap<String, Thread>,
    pub notifications: BTreeMap<String, InboxNotification>,
}

/// One page of the inbox as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboxFetch {
    pub threads: Vec<Thread>,
    pub notifications: Vec<InboxNotification>,
    pub deleted_threads: Vec<String>,
    pub deleted_notifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboxPatch {
    CreateThread(Thread),
    /// Also removes the thread's notifications.
    DeleteThread { thread_id: String },
    /// Shallow merge; a `null` value clears the key.
    EditThreadMetadata {
        thread_id: String,
        metadata: BTreeMap<String, Value>,
        updated_at: DateTime<Utc>,
    },
    CreateComment(Comment),
    /// Deleting the last comment deletes the thread.
    DeleteComment {
        thread_id: String,
        comment_id: String,
        deleted_at: DateTime<Utc>,
    },
    MarkNotificationRead { id: String, read_at: DateTime<Utc> },
    MarkAllNotificationsRead { read_at: DateTime<Utc> },
    DeleteNotification { id: String },
    DeleteAllNotifications,
}

pub struct Inbox;

impl CacheModel for Inbox {
    type Entities = InboxEntities;
    type Patch = InboxPatch;
    type Fetched = InboxFetch;

    fn apply(entities: &mut InboxEntities, patch: &InboxPatch) {
        match patch {
            InboxPatch::CreateThread(thread) => {
                entities.threads.insert(thread.id.clone(), thread.clone());
            }
            InboxPatch::DeleteThread { thread_id } => remove_thread(entities, thread_id),
            InboxPatch::EditThreadMetadata { thread_id, metadata, updated_at } => {
                if let Some(thread) = entities.threads.get_mut(thread_id) {
                    for (key, value) in metadata {
                        if value.is_null() {
                            thread.metadata.remove(key);
                        } else {
                            thread.metadata.insert(key.clone(), value.clone());
                        }
                    }
                    thread.updated_at = Some(*updated_at);
                }
            }
            InboxPatch::CreateComment(comment) => {
                if let Some(thread) = entities.threads.get_mut(&comment.thread_id) {
                    if !thread.comments.iter().any(|c| c.id == comment.id) {
                        thread.comments.push(comment.clone());
                    }
                    thread.updated_at = Some(comment.created_at);
                }
            }
            InboxPatch::DeleteComment { thread_id, comment_id, deleted_at } => {
                let Some(thread) = entities.threads.get_mut(thread_id) else {
                    return;
                };
                if let Some(comment) = thread.comments.iter_mut().find(|c| c.id == *comment_id) {
                    comment.deleted_at = Some(*deleted_at);
                    comment.body = None;
                }
                thread.updated_at = Some(*deleted_at);
                if thread.live_comments() == 0 {
                    remove_thread(entities, thread_id);
                }
            }
            InboxPatch::MarkNotificationRead { id, read_at } => {
                if let Some(n) = entities.notifications.get_mut(id) {
                    n.read_at = Some(*read_at);
                }
            }
            InboxPatch::MarkAllNotificationsRead { read_at } => {
                for n in entities.notifications.values_mut().filter(|n| n.is_unread()) {
                    n.read_at = Some(*read_at);
                }
            }
            InboxPatch::DeleteNotification { id } => {
                entities.notifications.remove(id);
            }
            InboxPatch::DeleteAllNotifications => entities.notifications.clear(),
        }
    }

    fn merge(entities: &mut InboxEntities, fetched: InboxFetch) {
        for thread in fetched.threads {
            entities.threads.insert(thread.id.clone(), thread);
        }
        for n in fetched.notifications {
            entities.notifications.insert(n.id.clone(), n);
        }
        for id in &fetched.deleted_threads {
            entities.threads.remove(id);
        }
        for id in &fetched.deleted_notifications {
            entities.notifications.remove(id);
        }
    }

    fn patch_kind(patch: &InboxPatch) -> &'static str {
        match patch {
            InboxPatch::CreateThread(_) => "create-thread",
            InboxPatch::DeleteThread { .. } => "delete-thread",
            InboxPatch::EditThreadMetadata { .. } => "edit-thread-metadata",
            InboxPatch::CreateComment(_) => "create-comment",
            InboxPatch::DeleteComment { .. } => "delete-comment",
            InboxPatch::MarkNotificationRead { .. } => "mark-notification-read",
            InboxPatch::MarkAllNotificationsRead { .. } => "mark-all-notifications-read",
            InboxPatch::DeleteNotification { .. } => "delete-notification",
            InboxPatch::DeleteAllNotifications => "delete-all-notifications",
        }
    }
}

fn remove_thread(entities: &mut InboxEntities, thread_id: &str) {
    entities.threads.remove(thread_id);
    entities.notifications.retain(|_, n| n.thread_id != thread_id);
}

/// Notifications whose thread is known, newest first.
pub fn selected_inbox_notifications(entities: &InboxEntities) -> Vec<InboxNotification> {
    let mut out: Vec<InboxNotification> = entities
        .notifications
        .values()
        .filter(|n| entities.threads.contains_key(&n.thread_id))
        .cloned()
        .collect();
    out.sort_by(|a, b| b.notified_at.cmp(&a.notified_at).then_with(|| a.id.cmp(&b.id)));
    out
}

pub fn unread_count(entities: &InboxEntities) -> usize {
    entities
        .notifications
        .values()
        .filter(|n| n.is_unread() && entities.threads.contains_key(&n.thread_id))
        .count()
}

pub fn thread(entities: &InboxEntities, id: &str) -> Option<Thread> {
    entities.threads.get(id).cloned()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Request/response boundary for inbox data.
pub trait InboxBackend: Send + Sync + 'static {
    fn fetch_inbox(&self) -> BoxFuture<'static, Result<InboxFetch, BackendError>>;
    fn create_thread(&self, thread: Thread) -> BoxFuture<'static, Result<(), BackendError>>;
    fn delete_thread(&self, thread_id: String) -> BoxFuture<'static, Result<(), BackendError>>;
    fn edit_thread_metadata(
        &self,
        thread_id: String,
        metadata: BTreeMap<String, Value>,
    ) -> BoxFuture<'static, Result<(), BackendError>>;
    fn create_comment(&self, comment: Comment) -> BoxFuture<'static, Result<(), BackendError>>;
    fn delete_comment(&self, thread_id: String, comment_id: String) -> BoxFuture<'static, Result<(), BackendError>>;
    fn mark_notification_read(&self, id: String) -> BoxFuture<'static, Result<(), BackendError>>;
    fn mark_all_notifications_read(&self) -> BoxFuture<'static, Result<(), BackendError>>;
    fn delete_notification(&self, id: String) -> BoxFuture<'static, Result<(), BackendError>>;
    fn delete_all_notifications(&self) -> BoxFuture<'static, Result<(), BackendError>>;
}

type Mutation = BoxFuture<'static, Result<(), CacheError>>;

/// Inbox operations with optimistic local effect.
pub struct InboxClient<B: InboxBackend> {
    backend: Arc<B>,
    cache: CacheStore<Inbox>,
}

impl<B: InboxBackend> Clone for InboxClient<B> {
    fn clone(&self) -> Self {
        Self { backend: self.backend.clone(), cache: self.cache.clone() }
    }
}

impl<B: InboxBackend> InboxClient<B> {
    pub fn new(backend: B) -> Self {
        Self { backend: Arc::new(backend), cache: CacheStore::default() }
    }

    pub fn cache(&self) -> &CacheStore<Inbox> {
        &self.cache
    }

    pub fn handle(&self) -> StoreHandle<CacheView<InboxEntities, InboxPatch>> {
        self.cache.handle()
    }

    pub fn inbox_notifications(&self) -> Vec<InboxNotification> {
        selected_inbox_notifications(&self.cache.entities())
    }

    pub fn unread_count(&self) -> usize {
        unread_count(&self.cache.entities())
    }

    pub fn thread(&self, id: &str) -> Option<Thread> {
        thread(&self.cache.entities(), id)
    }

    /// Load the inbox, joining a load already in progress.
    pub fn fetch_inbox(&self) -> QueryFuture {
        let backend = self.backend.clone();
        self.cache.query(INBOX_QUERY, move || backend.fetch_inbox())
    }

    /// Load the inbox again even if a load is in progress.
    pub fn refresh_inbox(&self) -> QueryFuture {
        let backend = self.backend.clone();
        self.cache.refetch(INBOX_QUERY, move || backend.fetch_inbox())
    }

    pub fn create_thread(&self, thread: Thread) -> Mutation {
        let backend = self.backend.clone();
        let request = thread.clone();
        self.cache
            .mutate(InboxPatch::CreateThread(thread), move || backend.create_thread(request))
    }

    pub fn delete_thread(&self, thread_id: &str) -> Mutation {
        if let Err(e) = self.require_thread(thread_id) {
            return future::ready(Err(e)).boxed();
        }
        let backend = self.backend.clone();
        let id = thread_id.to_string();
        self.cache.mutate(
            InboxPatch::DeleteThread { thread_id: id.clone() },
            move || backend.delete_thread(id),
        )
    }

    pub fn edit_thread_metadata(&self, thread_id: &str, metadata: BTreeMap<String, Value>) -> Mutation {
        if let Err(e) = self.require_thread(thread_id) {
            return future::ready(Err(e)).boxed();
        }
        let backend = self.backend.clone();
        let id = thread_id.to_string();
        let patch = InboxPatch::EditThreadMetadata {
            thread_id: id.clone(),
            metadata: metadata.clone(),
            updated_at: Utc::now(),
        };
        self.cache
            .mutate(patch, move || backend.edit_thread_metadata(id, metadata))
    }

    pub fn create_comment(&self, comment: Comment) -> Mutation {
        if let Err(e) = self.require_thread(&comment.thread_id) {
            return future::ready(Err(e)).boxed();
        }
        let backend = self.backend.clone();
        let request = comment.clone();
        self.cache
            .mutate(InboxPatch::CreateComment(comment), move || backend.create_comment(request))
    }

    pub fn delete_comment(&self, thread_id: &str, comment_id: &str) -> Mutation {
        if let Err(e) = self.require_thread(thread_id) {
            return future::ready(Err(e)).boxed();
        }
        let backend = self.backend.clone();
        let (tid, cid) = (thread_id.to_string(), comment_id.to_string());
        let patch = InboxPatch::DeleteComment {
            thread_id: tid.clone(),
            comment_id: cid.clone(),
            deleted_at: Utc::now(),
        };
        self.cache.mutate(patch, move || backend.delete_comment(tid, cid))
    }

    pub fn mark_notification_read(&self, id: &str) -> Mutation {
        if !self.cache.entities().notifications.contains_key(id) {
            return future::ready(Err(unknown("notification", id))).boxed();
        }
        let backend = self.backend.clone();
        let owned = id.to_string();
        self.cache.mutate(
            InboxPatch::MarkNotificationRead { id: owned.clone(), read_at: Utc::now() },
            move || backend.mark_notification_read(owned),
        )
    }

    pub fn mark_all_notifications_read(&self) -> Mutation {
        let backend = self.backend.clone();
        self.cache.mutate(
            InboxPatch::MarkAllNotificationsRead { read_at: Utc::now() },
            move || backend.mark_all_notifications_read(),
        )
    }

    pub fn delete_notification(&self, id: &str) -> Mutation {
        if !self.cache.entities().notifications.contains_key(id) {
            return future::ready(Err(unknown("notification", id))).boxed();
        }
        let backend = self.backend.clone();
        let owned = id.to_string();
        self.cache.mutate(
            InboxPatch::DeleteNotification { id: owned.clone() },
            move || backend.delete_notification(owned),
        )
    }

    pub fn delete_all_notifications(&self) -> Mutation {
        let backend = self.backend.clone();
        self.cache
            .mutate(InboxPatch::DeleteAllNotifications, move || backend.delete_all_notifications())
    }

    fn require_thread(&self, id: &str) -> Result<(), CacheError> {
        if self.cache.entities().threads.contains_key(id) {
            Ok(())
        } else {
            Err(unknown("thread", id))
        }
    }
}

fn unknown(entity: &'static str, id: &str) -> CacheError {
    CacheError::UnknownEntity { entity, id: id.to_string() }
}
