//! Cardápio menu sync engine.
//!
//! Keeps a client-side copy of the bakery menu (categories, products, the
//! site logo and site configuration) consistent with the remote store:
//! hydrate from the local cache, poll the sync endpoint, fan fresh state out
//! to sibling views, and apply admin mutations optimistically with rollback.
//!
//! The moving parts:
//! - [`api::RemoteStore`] / [`api::HttpRemoteStore`]: the sync endpoint.
//! - [`cache::LocalCache`]: SQLite mirror of the last known menu.
//! - [`broadcast::CrossTabChannel`]: in-process fan-out between engines.
//! - [`synced::SyncedData`]: the refresh engine and observable state.
//! - [`actions::MenuActions`]: admin mutations.

pub mod actions;
pub mod api;
pub mod broadcast;
pub mod bus;
pub mod cache;
pub mod config;
pub mod credentials;
mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod retry;
pub mod synced;

#[cfg(test)]
pub(crate) mod test_support;

pub use actions::MenuActions;
pub use api::{HttpRemoteStore, RemoteStore};
pub use broadcast::{CrossTabChannel, MenuBroadcast};
pub use cache::LocalCache;
pub use config::SyncConfig;
pub use error::SyncError;
pub use models::{Category, Logo, MenuSnapshot, Product, SiteConfig};
pub use notifications::{Notifier, Toast, ToastLevel};
pub use synced::{
    EngineSettings, OptimisticPatch, PendingWrite, RefreshOutcome, SyncHandle, SyncPhase,
    SyncedData, SyncedState,
};
