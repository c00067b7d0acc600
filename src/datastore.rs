//! Meeting and user lookups against the datastore reader.
//!
//! # Purpose
//! The engines only need a handful of fields to enforce permissions and to
//! enrich applause messages. The [`Datastore`] trait names exactly those
//! lookups; [`HttpDatastore`] resolves them through the reader's `get_many`
//! endpoint and [`MemoryDatastore`] backs tests.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

pub type Result<T> = std::result::Result<T, DatastoreError>;

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("datastore request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("datastore returned status {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// `meeting/<id>/applause_enable`.
    async fn applause_enabled(&self, meeting_id: i32) -> Result<bool>;

    /// `meeting/<id>/enable_anonymous`.
    async fn anonymous_enabled(&self, meeting_id: i32) -> Result<bool>;

    /// `user/<id>/organization_management_level`, empty when unset.
    async fn organization_management_level(&self, user_id: i32) -> Result<String>;

    /// Whether the user is in any group of the meeting.
    async fn has_meeting_groups(&self, user_id: i32, meeting_id: i32) -> Result<bool>;

    /// `|meeting/<id>/present_user_ids|`; a missing field counts as zero.
    async fn present_user_count(&self, meeting_id: i32) -> Result<usize>;
}

/// Client for the datastore reader's `get_many` JSON endpoint.
pub struct HttpDatastore {
    url: String,
    client: reqwest::Client,
}

impl HttpDatastore {
    pub fn new(base_url: &str) -> Self {
        Self {
            url: format!(
                "{}/internal/datastore/reader/get_many",
                base_url.trim_end_matches('/')
            ),
            client: reqwest::Client::new(),
        }
    }

    /// Fetches one field and returns `None` when the object or field does
    /// not exist.
    async fn field(&self, collection: &str, id: i32, field: &str) -> Result<Option<Value>> {
        let body = serde_json::json!({
            "requests": [format!("{collection}/{id}/{field}")],
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(DatastoreError::Status(response.status()));
        }

        let payload: Value = response.json().await?;
        Ok(payload
            .get(collection)
            .and_then(|objects| objects.get(id.to_string()))
            .and_then(|object| object.get(field))
            .filter(|value| !value.is_null())
            .cloned())
    }
}

#[async_trait]
impl Datastore for HttpDatastore {
    async fn applause_enabled(&self, meeting_id: i32) -> Result<bool> {
        let value = self.field("meeting", meeting_id, "applause_enable").await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn anonymous_enabled(&self, meeting_id: i32) -> Result<bool> {
        let value = self.field("meeting", meeting_id, "enable_anonymous").await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn organization_management_level(&self, user_id: i32) -> Result<String> {
        let value = self
            .field("user", user_id, "organization_management_level")
            .await?;
        Ok(value
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default())
    }

    async fn has_meeting_groups(&self, user_id: i32, meeting_id: i32) -> Result<bool> {
        let field = format!("group_${meeting_id}_ids");
        let value = self.field("user", user_id, &field).await?;
        Ok(value
            .and_then(|v| v.as_array().map(|ids| !ids.is_empty()))
            .unwrap_or(false))
    }

    async fn present_user_count(&self, meeting_id: i32) -> Result<usize> {
        let value = self.field("meeting", meeting_id, "present_user_ids").await?;
        Ok(value
            .and_then(|v| v.as_array().map(Vec::len))
            .unwrap_or(0))
    }
}

/// Mutable in-memory datastore for tests.
#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    applause_enabled: HashMap<i32, bool>,
    anonymous_enabled: HashMap<i32, bool>,
    management_level: HashMap<i32, String>,
    // (user, meeting) -> member of any group.
    meeting_groups: HashMap<(i32, i32), bool>,
    present_users: HashMap<i32, usize>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_applause_enabled(&self, meeting_id: i32, enabled: bool) {
        self.state
            .lock()
            .expect("datastore lock")
            .applause_enabled
            .insert(meeting_id, enabled);
    }

    pub fn set_anonymous_enabled(&self, meeting_id: i32, enabled: bool) {
        self.state
            .lock()
            .expect("datastore lock")
            .anonymous_enabled
            .insert(meeting_id, enabled);
    }

    pub fn set_management_level(&self, user_id: i32, level: &str) {
        self.state
            .lock()
            .expect("datastore lock")
            .management_level
            .insert(user_id, level.to_string());
    }

    pub fn add_to_meeting(&self, user_id: i32, meeting_id: i32) {
        self.state
            .lock()
            .expect("datastore lock")
            .meeting_groups
            .insert((user_id, meeting_id), true);
    }

    pub fn set_present_users(&self, meeting_id: i32, count: usize) {
        self.state
            .lock()
            .expect("datastore lock")
            .present_users
            .insert(meeting_id, count);
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn applause_enabled(&self, meeting_id: i32) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .expect("datastore lock")
            .applause_enabled
            .get(&meeting_id)
            .unwrap_or(&false))
    }

    async fn anonymous_enabled(&self, meeting_id: i32) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .expect("datastore lock")
            .anonymous_enabled
            .get(&meeting_id)
            .unwrap_or(&false))
    }

    async fn organization_management_level(&self, user_id: i32) -> Result<String> {
        Ok(self
            .state
            .lock()
            .expect("datastore lock")
            .management_level
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn has_meeting_groups(&self, user_id: i32, meeting_id: i32) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .expect("datastore lock")
            .meeting_groups
            .get(&(user_id, meeting_id))
            .unwrap_or(&false))
    }

    async fn present_user_count(&self, meeting_id: i32) -> Result<usize> {
        Ok(*self
            .state
            .lock()
            .expect("datastore lock")
            .present_users
            .get(&meeting_id)
            .unwrap_or(&0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    /// Reader stub that knows one meeting and one user.
    async fn spawn_reader() -> String {
        let app = Router::new().route(
            "/internal/datastore/reader/get_many",
            post(|Json(_body): Json<Value>| async move {
                Json(serde_json::json!({
                    "meeting": {
                        "1": {
                            "applause_enable": true,
                            "present_user_ids": [4, 5, 6],
                        },
                    },
                    "user": {
                        "5": {
                            "organization_management_level": "superadmin",
                            "group_$1_ids": [3],
                        },
                    },
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind reader stub");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_datastore_reads_meeting_fields() {
        let datastore = HttpDatastore::new(&spawn_reader().await);

        assert!(datastore.applause_enabled(1).await.expect("field"));
        assert_eq!(datastore.present_user_count(1).await.expect("field"), 3);
        // enable_anonymous is absent from the stub object.
        assert!(!datastore.anonymous_enabled(1).await.expect("field"));
    }

    #[tokio::test]
    async fn http_datastore_reads_user_fields() {
        let datastore = HttpDatastore::new(&spawn_reader().await);

        assert_eq!(
            datastore
                .organization_management_level(5)
                .await
                .expect("field"),
            "superadmin"
        );
        assert!(datastore.has_meeting_groups(5, 1).await.expect("field"));
    }

    #[tokio::test]
    async fn missing_objects_fall_back_to_defaults() {
        let datastore = HttpDatastore::new(&spawn_reader().await);

        assert!(!datastore.applause_enabled(99).await.expect("field"));
        assert_eq!(datastore.present_user_count(99).await.expect("field"), 0);
        assert_eq!(
            datastore
                .organization_management_level(99)
                .await
                .expect("field"),
            ""
        );
        assert!(!datastore.has_meeting_groups(99, 1).await.expect("field"));
    }
}
