// File: fei-sync/src/api.rs
// Purpose: Remote backend seam consumed by the sync engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::queue::QueuedMutation;
use crate::record::{Carcasse, CarcasseIntermediaire, CollectionName, Entity, Fei, User};

/// Standard response envelope of the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn into_data(self, status: u16) -> Result<T, ApiError> {
        match (self.ok, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(ApiError::Decode("envelope has no data".to_string())),
            (false, _) => Err(ApiError::Status {
                status,
                message: self.error.unwrap_or_else(|| "request refused".to_string()),
            }),
        }
    }
}

/// `GET /now`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNow {
    pub now: DateTime<Utc>,
}

/// `GET /<collection>?after=..&withDeleted=true`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsPage {
    pub items: Vec<Value>,
}

/// `GET /user/me`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilePayload {
    pub user: User,
}

/// `GET /user/my-relations`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relations {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub users: Vec<User>,
}

/// `GET /fei`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFeiBuckets {
    #[serde(default)]
    pub feis_ongoing: Vec<Fei>,
    #[serde(default)]
    pub feis_to_take: Vec<Fei>,
    #[serde(default)]
    pub feis_under_my_responsability: Vec<Fei>,
}

/// `GET /fei/done`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneFeis {
    #[serde(default)]
    pub feis_done: Vec<Fei>,
}

/// Every form bucket the actor can see. A form may sit in several buckets.
#[derive(Debug, Clone, Default)]
pub struct FeiBuckets {
    pub open: OpenFeiBuckets,
    pub done: DoneFeis,
}

impl FeiBuckets {
    /// All buckets flattened, duplicates included
    pub fn into_all(self) -> Vec<Fei> {
        let mut all = self.open.feis_ongoing;
        all.extend(self.open.feis_to_take);
        all.extend(self.open.feis_under_my_responsability);
        all.extend(self.done.feis_done);
        all
    }
}

/// `GET /fei/<numero>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeiDetail {
    pub fei: Fei,
    #[serde(default)]
    pub carcasses: Vec<Carcasse>,
    #[serde(default)]
    pub carcasses_intermediaires: Vec<CarcasseIntermediaire>,
}

/// `POST /<collection>/sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAccepted {
    /// Server's copy after applying the mutation, absent for deletes
    #[serde(default)]
    pub item: Option<Value>,
}

/// Already-authenticated access to the backend
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Server clock, used as the next high-water mark
    async fn now(&self) -> Result<DateTime<Utc>, ApiError>;

    async fn fetch_profile(&self) -> Result<User, ApiError>;

    async fn fetch_relations(&self) -> Result<Relations, ApiError>;

    /// Records of `collection` updated after `after`, tombstones included
    async fn fetch_since(
        &self,
        collection: CollectionName,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, ApiError>;

    async fn fetch_fei_buckets(&self) -> Result<FeiBuckets, ApiError>;

    async fn fetch_fei_detail(&self, numero: &str) -> Result<FeiDetail, ApiError>;

    async fn push_mutation(&self, mutation: &QueuedMutation) -> Result<PushAccepted, ApiError>;
}
