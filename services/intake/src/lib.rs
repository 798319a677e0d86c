//! Partybox Intake Service
//!
//! Telegram bot backend that collects party photos from guests. Every guest
//! may upload a limited number of photos; each accepted photo is brightened,
//! stored under the guest's own directory, and all photos can later be
//! downloaded as a single ZIP archive.
//!
//! ## Features
//!
//! - **Per-user quota**: a counter per guest, serialized per guest and
//!   reconciled from disk after a restart
//! - **Reserve / commit / rollback**: a sequence number is reserved before the
//!   photo is written and released again if the transform or write fails
//! - **Crash-safe storage**: photos become visible only through an atomic
//!   rename, so listings never see half-written files
//! - **ZIP export**: per guest, or for every guest by the privileged user
//! - **Authenticated webhook**: deliveries must carry the configured secret
//!   both in the path and in Telegram's secret-token header
//!
//! ## Architecture
//!
//! ```text
//! Telegram                Webhook Server              Event Adapter
//! ┌──────────────┐       ┌──────────────┐           ┌──────────────┐
//! │ Bot API      │──────▶│ POST         │──────────▶│ commands     │
//! │ updates      │       │ /webhook/..  │           │ photos       │
//! └──────────────┘       └──────────────┘           └──────────────┘
//!        ▲                                            │         │
//!        │ replies, documents                         ▼         ▼
//!        │                                 ┌──────────────┐ ┌──────────────┐
//!        └─────────────────────────────────│ Intake       │ │ Archive      │
//!                                          │ Pipeline     │ │ Builder      │
//!                                          └──────────────┘ └──────────────┘
//!                                             │         │          │
//!                                             ▼         ▼          ▼
//!                                  ┌──────────────┐ ┌──────────────────────┐
//!                                  │ Counter      │ │ Storage Layout       │
//!                                  │ Store        │─│ {root}/{user}/{n}.jpg│
//!                                  └──────────────┘ └──────────────────────┘
//! ```

pub mod archive;
pub mod config;
pub mod counter_store;
pub mod event_adapter;
pub mod intake;
pub mod storage_layout;
pub mod telegram;
pub mod transform;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;

pub use archive::{ArchiveBuilder, ArchiveEntry, ArchiveError, ArchiveReport, ArchiveScope, ArchiveStream};
pub use config::Config;
pub use counter_store::{CounterError, CounterStore, UserSlot};
pub use event_adapter::{Command, EventAdapter};
pub use intake::{IntakePipeline, Outcome, RejectReason};
pub use storage_layout::{NamespaceScan, StorageError, StorageLayout, StoredPhoto, UserId};
pub use telegram::{BotApi, BotApiError, TelegramClient, Update};
pub use transform::{BrightnessFilter, PhotoTransform, TransformError};
pub use webhook::AppState;
