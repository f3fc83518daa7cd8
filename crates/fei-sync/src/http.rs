// File: fei-sync/src/http.rs
// Purpose: RemoteApi over HTTP with reqwest

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::{
    DoneFeis, Envelope, FeiBuckets, FeiDetail, ItemsPage, OpenFeiBuckets, ProfilePayload,
    PushAccepted, Relations, RemoteApi, ServerNow,
};
use crate::config::ApiSettings;
use crate::error::ApiError;
use crate::queue::QueuedMutation;
use crate::record::{CollectionName, User};

/// Longest error body echoed back in an `ApiError::Status`
const MAX_ERROR_BODY: usize = 200;

/// HTTP client for the backend. Credentials are set once at construction.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base_url: Url,
}

impl HttpApi {
    pub fn new(settings: &ApiSettings) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(key) = &settings.api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| ApiError::Network(format!("invalid api key: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(settings.timeout())
            .default_headers(headers)
            .build()?;

        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| ApiError::Network(format!("invalid base url {}: {e}", settings.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Network(format!("invalid base url {}", settings.base_url)));
        }

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Append path segments to the base url; each segment is percent-encoded
    /// so record keys cannot change the route
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.endpoint(segments);
        tracing::debug!(path = url.path(), "GET");
        let response = self.client.get(url).query(query).send().await?;
        decode(response).await
    }
}

/// Unwrap the `{ ok, data, error }` envelope, mapping failures onto ApiError
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.bytes().await?;

    match serde_json::from_slice::<Envelope<T>>(&body) {
        Ok(envelope) if status.is_success() => envelope.into_data(status.as_u16()),
        Ok(envelope) => Err(ApiError::Status {
            status: status.as_u16(),
            message: envelope
                .error
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
        }),
        Err(e) if status.is_success() => Err(ApiError::Decode(e.to_string())),
        Err(_) => {
            let text = String::from_utf8_lossy(&body);
            Err(ApiError::Status {
                status: status.as_u16(),
                message: text.chars().take(MAX_ERROR_BODY).collect(),
            })
        }
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn now(&self) -> Result<DateTime<Utc>, ApiError> {
        let now: ServerNow = self.get(&["now"], &[]).await?;
        Ok(now.now)
    }

    async fn fetch_profile(&self) -> Result<User, ApiError> {
        let payload: ProfilePayload = self.get(&["user", "me"], &[]).await?;
        Ok(payload.user)
    }

    async fn fetch_relations(&self) -> Result<Relations, ApiError> {
        self.get(&["user", "my-relations"], &[]).await
    }

    async fn fetch_since(
        &self,
        collection: CollectionName,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, ApiError> {
        let mut query = vec![("withDeleted", "true".to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let page: ItemsPage = self.get(&[collection.as_str()], &query).await?;
        Ok(page.items)
    }

    async fn fetch_fei_buckets(&self) -> Result<FeiBuckets, ApiError> {
        let open: OpenFeiBuckets = self.get(&["fei"], &[]).await?;
        let done: DoneFeis = self.get(&["fei", "done"], &[]).await?;
        Ok(FeiBuckets { open, done })
    }

    async fn fetch_fei_detail(&self, numero: &str) -> Result<FeiDetail, ApiError> {
        self.get(&["fei", numero], &[]).await
    }

    async fn push_mutation(&self, mutation: &QueuedMutation) -> Result<PushAccepted, ApiError> {
        let url = self.endpoint(&[mutation.collection.as_str(), "sync"]);
        tracing::debug!(path = url.path(), key = %mutation.record_key, kind = %mutation.kind, "POST");

        let response = self
            .client
            .post(url)
            .json(mutation)
            .send()
            .await?;
        decode(response).await
    }
}
