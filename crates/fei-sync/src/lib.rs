// File: fei-sync/src/lib.rs
// Purpose: Main entry point for the fei-sync library

//! # fei-sync
//!
//! Offline-first client state sync for wild-game chain-of-custody forms
//! (FEI), their carcasses and intermediary handoffs.
//!
//! ## Features
//!
//! - **Local cache**: one in-memory snapshot, persisted to memory,
//!   filesystem or SQLite, readable synchronously
//! - **Incremental sync**: per-collection high-water marks taken from the
//!   server clock, tombstones consumed on merge
//! - **Last writer wins**: whole-record freshness by `updated_at`
//! - **Outbound queue**: local writes survive restarts and replay when the
//!   connection comes back
//! - **Connectivity guard**: a very bad connection keeps the device offline
//!   until a probe succeeds
//!
//! ## Example
//!
//! ```rust,ignore
//! use fei_sync::{CacheStore, ConnectivityMonitor, HttpApi, SyncEngine, SyncSettings};
//! use std::sync::Arc;
//!
//! let settings = SyncSettings::load_default()?;
//! let store = CacheStore::from_backend(&settings.store).await?;
//! let api = Arc::new(HttpApi::new(&settings.api)?);
//! let monitor = ConnectivityMonitor::new(Some(true));
//!
//! let engine = SyncEngine::new(store, api, monitor, settings.sync);
//! engine.spawn_connectivity_loop();
//! let report = engine.on_start().await;
//! ```

pub mod api;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod freshness;
pub mod http;
pub mod merge;
pub mod queue;
pub mod record;
pub mod store;

pub use api::RemoteApi;
pub use config::{ApiSettings, StoreBackend, SyncOptions, SyncSettings};
pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivityProbe, ConnectivityState, Transition};
pub use engine::{StepOutcome, SyncEngine, SyncReport, SyncTarget};
pub use error::{ApiError, SyncError, SyncResult};
pub use freshness::{collapse_freshest, resolve_freshest, resolve_optional};
pub use http::HttpApi;
pub use merge::{merge_items, merge_records};
pub use queue::{MutationKind, OutboundQueue, QueuedMutation};
pub use record::{
    Carcasse, CarcasseIntermediaire, CarcasseKey, CollectionName, Entity, Fei, IntermediaireKey,
    TrackedRecord, User,
};
pub use store::{CacheStore, Storage, StoreEvent, StoreState};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};

    use crate::record::{Carcasse, ExtraFields, Fei, TrackedRecord};

    pub fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    pub fn fei(numero: &str, updated_at: &str) -> Fei {
        Fei {
            numero: numero.to_string(),
            date_mise_a_mort: None,
            commune_mise_a_mort: None,
            created_by_user_id: None,
            examinateur_initial_user_id: None,
            premier_detenteur_user_id: None,
            premier_detenteur_entity_id: None,
            fei_current_owner_user_id: None,
            fei_current_owner_entity_id: None,
            fei_current_owner_role: None,
            fei_next_owner_user_id: None,
            fei_next_owner_entity_id: None,
            fei_next_owner_role: None,
            automatic_closed_at: None,
            svi_closed_at: None,
            created_at: ts("2024-01-01T00:00:00Z"),
            updated_at: ts(updated_at),
            deleted_at: None,
            extra: ExtraFields::new(),
        }
    }

    pub fn carcasse(fei_numero: &str, bracelet: &str, updated_at: &str) -> Carcasse {
        Carcasse {
            zacharie_carcasse_id: format!("{fei_numero}_{bracelet}"),
            fei_numero: fei_numero.to_string(),
            numero_bracelet: bracelet.to_string(),
            espece: None,
            kind: None,
            nombre_d_animaux: None,
            svi_carcasse_status: None,
            created_at: ts("2024-01-01T00:00:00Z"),
            updated_at: ts(updated_at),
            deleted_at: None,
            extra: ExtraFields::new(),
        }
    }

    pub fn deleted<T: TrackedRecord>(mut record: T, at: &str) -> T {
        record.set_deleted_at(Some(ts(at)));
        record
    }
}
