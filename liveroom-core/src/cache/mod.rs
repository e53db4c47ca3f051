//! Optimistic cache for request/response entities.

pub mod inbox;
pub mod store;

pub use inbox::{
    selected_inbox_notifications, unread_count, BackendError, Comment, Inbox, InboxBackend, InboxClient,
    InboxEntities, InboxFetch, InboxNotification, InboxPatch, Thread, INBOX_QUERY,
};
pub use store::{CacheError, CacheModel, CacheStore, CacheView, OptimisticUpdate, QueryFuture, QueryState, UpdateStatus};
