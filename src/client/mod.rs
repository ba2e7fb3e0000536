//! MLStorage server client
//!
//! Blocking HTTP client for the external MLStorage server, which owns
//! experiment documents and assigns their storage directories. The launcher
//! creates a document per run, streams field updates (`result`, `webapp`,
//! `config`) while the program executes, heartbeats, and finally marks the
//! document finished.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Connection timeout for storage server requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from storage server interactions
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("experiment document is missing field {0:?}")]
    MissingField(&'static str),
}

/// Result alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Lifecycle status of an experiment document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// The program is executing
    Running,
    /// The program exited with code 0
    Completed,
    /// The program exited with a non-zero code or could not be launched
    Failed,
}

/// An experiment document as stored by the MLStorage server.
///
/// Only the fields the launcher touches are typed; everything else the
/// server keeps on the document survives round-trips through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webapp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExperimentDoc {
    /// The storage directory assigned by the server, required for launching.
    pub fn require_storage_dir(&self) -> Result<&str> {
        self.storage_dir
            .as_deref()
            .ok_or(ClientError::MissingField("storage_dir"))
    }
}

/// Client for one MLStorage server.
#[derive(Debug, Clone)]
pub struct MLStorageClient {
    uri: String,
    http: reqwest::blocking::Client,
}

impl MLStorageClient {
    /// Create a client for `uri` (e.g. `http://127.0.0.1:8080`).
    pub fn new(uri: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            uri: uri.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// The server URI this client talks to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/v1{}", self.uri, endpoint)
    }

    fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response.text().unwrap_or_default();
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    fn post_doc(&self, endpoint: &str, body: &Value) -> Result<ExperimentDoc> {
        let url = self.url(endpoint);
        debug!(%url, "posting to storage server");
        let response = Self::check(self.http.post(&url).json(body).send()?)?;
        Ok(response.json()?)
    }

    /// Create a new experiment document; the server assigns its id and
    /// storage directory.
    pub fn create(&self, fields: Map<String, Value>) -> Result<ExperimentDoc> {
        self.post_doc("/_create", &Value::Object(fields))
    }

    /// Fetch an experiment document by id.
    pub fn get(&self, id: &str) -> Result<ExperimentDoc> {
        let url = self.url(&format!("/_get/{id}"));
        debug!(%url, "fetching experiment document");
        let response = Self::check(self.http.get(&url).send()?)?;
        Ok(response.json()?)
    }

    /// Update fields on an experiment document.
    pub fn update(&self, id: &str, fields: Map<String, Value>) -> Result<ExperimentDoc> {
        self.post_doc(&format!("/_update/{id}"), &Value::Object(fields))
    }

    /// Tell the server the run is still alive.
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/_heartbeat/{id}"));
        Self::check(self.http.post(&url).json(&Value::Object(Map::new())).send()?)?;
        Ok(())
    }

    /// Mark the run finished, setting its status alongside any final fields.
    pub fn set_finished(
        &self,
        id: &str,
        status: RunStatus,
        mut fields: Map<String, Value>,
    ) -> Result<ExperimentDoc> {
        fields.insert("status".to_string(), serde_json::to_value(status)?);
        self.post_doc(&format!("/_set_finished/{id}"), &Value::Object(fields))
    }

    /// Delete an experiment document.
    pub fn delete(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/_delete/{id}"));
        Self::check(self.http.post(&url).json(&Value::Object(Map::new())).send()?)?;
        Ok(())
    }

    /// Query experiment documents matching `filter`.
    pub fn query(&self, filter: Value, skip: u64, limit: u64) -> Result<Vec<ExperimentDoc>> {
        let url = self.url(&format!("/_query?skip={skip}&limit={limit}"));
        debug!(%url, "querying storage server");
        let response = Self::check(self.http.post(&url).json(&filter).send()?)?;
        Ok(response.json()?)
    }
}
