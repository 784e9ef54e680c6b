//! Views over per-kind versioned stores: object API, patching, structured
//! events, client facades and sandbox views.

#![forbid(unsafe_code)]

mod access;
mod client;
mod config;
mod events;
pub mod patch;
mod view;
pub mod wire;

pub use access::ViewAccess;
pub use client::{ClientMode, InProcClient, ViewClient, WatchGuard, WatchStream, WireClient};
pub use config::ViewConfig;
pub use events::{
    EventRecord, EventSink, RecordedEvent, REASON_BINDING, REASON_FAILED_SCHEDULING, REASON_SCHEDULED, TYPE_NORMAL,
    TYPE_WARNING,
};
pub use patch::PatchKind;
pub use view::{assigned_node, awaits_scheduling, StoreStat, View};

pub use advisor_store::{QueuePolicy, StoreConfig, WatchOptions};
