//! Microsoft Graph API client for OneDrive.

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use graphdrive_common::{DrivePath, Error, Result};

use crate::auth::TokenManager;
use crate::types::{
    ConflictBehavior, DriveInfo, DriveItem, GraphErrorBody, GraphPage, UploadSession,
};

/// Largest payload sent with a single PUT; anything bigger uses an upload session.
pub const SIMPLE_UPLOAD_LIMIT: usize = 4 * 1024 * 1024;

/// Upload session chunk size (must be a multiple of 320 KiB).
pub const CHUNK_SIZE: usize = 10 * 320 * 1024;

/// Characters escaped inside one path segment of a `root:/...:` address.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Graph API client.
///
/// One method per Graph call. Every call takes its bearer token from the
/// shared [`TokenManager`], which refreshes it when it is about to expire.
pub struct GraphClient {
    http: Client,
    base_url: String,
    token_manager: Arc<TokenManager>,
}

impl GraphClient {
    /// Create a new Graph client rooted at `base_url`
    /// (e.g. `https://graph.microsoft.com/v1.0/`).
    pub fn new(
        token_manager: Arc<TokenManager>,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("graphdrive/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_manager,
        })
    }

    /// URL addressing the item at `path`.
    pub fn item_url(&self, path: &DrivePath) -> String {
        if path.is_root() {
            format!("{}/me/drive/root", self.base_url)
        } else {
            format!("{}/me/drive/root:/{}:", self.base_url, encode_path(path))
        }
    }

    /// URL of an action or relationship below the item at `path`,
    /// e.g. `children` or `content`.
    pub fn item_action_url(&self, path: &DrivePath, action: &str) -> String {
        format!("{}/{}", self.item_url(path), action)
    }

    fn item_id_url(&self, item_id: &str) -> String {
        format!(
            "{}/me/drive/items/{}",
            self.base_url,
            utf8_percent_encode(item_id, SEGMENT)
        )
    }

    /// Attach a fresh bearer token and send.
    async fn send(&self, request: RequestBuilder, action: &str) -> Result<Response> {
        let token = self.token_manager.get_access_token().await?;

        request
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} failed: {}", action, e)))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> Result<T> {
        let response = self.send(request, action).await?;
        parse_json(response).await
    }

    /// Fetch the signed-in user's drive.
    pub async fn get_drive(&self) -> Result<DriveInfo> {
        let url = format!("{}/me/drive", self.base_url);
        self.send_json(self.http.get(&url), "Drive request").await
    }

    /// Get item metadata by path.
    pub async fn get_item(&self, path: &DrivePath) -> Result<DriveItem> {
        let url = self.item_url(path);
        tracing::debug!("GET {}", url);
        self.send_json(self.http.get(&url), "Metadata request").await
    }

    /// List all children of a folder, following `@odata.nextLink`.
    pub async fn list_children(&self, path: &DrivePath) -> Result<Vec<DriveItem>> {
        let mut items = Vec::new();
        let mut next = Some(self.item_action_url(path, "children"));

        while let Some(url) = next {
            tracing::debug!("GET {}", url);
            let page: GraphPage<DriveItem> =
                self.send_json(self.http.get(&url), "Listing").await?;
            items.extend(page.value);
            next = page.next_link;
        }

        Ok(items)
    }

    /// Create a folder below `parent`; fails if the name is taken.
    pub async fn create_folder(&self, parent: &DrivePath, name: &str) -> Result<DriveItem> {
        let url = self.item_action_url(parent, "children");
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": ConflictBehavior::Fail.as_str(),
        });

        self.send_json(self.http.post(&url).json(&body), "Folder creation")
            .await
    }

    /// Upload a small file with a single PUT.
    pub async fn upload_simple(
        &self,
        path: &DrivePath,
        data: Bytes,
        conflict: ConflictBehavior,
    ) -> Result<DriveItem> {
        let url = self.item_action_url(path, "content");
        tracing::debug!("PUT {} ({} bytes)", url, data.len());

        let request = self
            .http
            .put(&url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .query(&[("@microsoft.graph.conflictBehavior", conflict.as_str())])
            .body(data);

        self.send_json(request, "Upload").await
    }

    async fn create_upload_session(
        &self,
        path: &DrivePath,
        conflict: ConflictBehavior,
    ) -> Result<UploadSession> {
        let url = self.item_action_url(path, "createUploadSession");
        let body = serde_json::json!({
            "item": { "@microsoft.graph.conflictBehavior": conflict.as_str() }
        });

        self.send_json(self.http.post(&url).json(&body), "Upload session request")
            .await
    }

    /// Send one chunk of an upload session.
    ///
    /// Returns the item once the last chunk is accepted, `None` while more
    /// chunks are expected. The session URL is pre-authenticated and must
    /// not receive the bearer token.
    async fn upload_chunk(
        &self,
        upload_url: &str,
        chunk: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Result<Option<DriveItem>> {
        let last = offset + chunk.len() as u64 - 1;

        let response = self
            .http
            .put(upload_url)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, last, total_size),
            )
            .body(chunk)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Chunk upload failed: {}", e)))?;

        if response.status() == StatusCode::ACCEPTED {
            return Ok(None);
        }
        parse_json(response).await.map(Some)
    }

    /// Upload a large file through an upload session.
    pub async fn upload_large(
        &self,
        path: &DrivePath,
        data: Bytes,
        conflict: ConflictBehavior,
    ) -> Result<DriveItem> {
        let session = self.create_upload_session(path, conflict).await?;
        tracing::debug!(
            "Upload session for {} open until {:?}",
            path,
            session.expiration_date_time
        );

        let total_size = data.len() as u64;
        for start in (0..data.len()).step_by(CHUNK_SIZE) {
            let end = (start + CHUNK_SIZE).min(data.len());
            let chunk = data.slice(start..end);

            if let Some(item) = self
                .upload_chunk(&session.upload_url, chunk, start as u64, total_size)
                .await?
            {
                return Ok(item);
            }
        }

        Err(Error::Network(format!(
            "Upload session for {} ended without returning the item",
            path
        )))
    }

    /// Download file content by path.
    pub async fn download(&self, path: &DrivePath) -> Result<Vec<u8>> {
        self.download_url(&self.item_action_url(path, "content")).await
    }

    /// Download file content by item ID.
    pub async fn download_by_id(&self, item_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/content", self.item_id_url(item_id));
        self.download_url(&url).await
    }

    async fn download_url(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!("GET {}", url);

        // Graph answers with a 302 to a pre-authenticated URL; reqwest
        // follows it and drops the Authorization header across hosts.
        let response = self.send(self.http.get(url), "Download").await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let content = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Download interrupted: {}", e)))?;
        Ok(content.to_vec())
    }

    /// Move an item into another folder.
    pub async fn move_item(&self, item_id: &str, new_parent_id: &str) -> Result<DriveItem> {
        let url = self.item_id_url(item_id);
        let body = serde_json::json!({
            "parentReference": { "id": new_parent_id }
        });

        self.send_json(self.http.patch(&url).json(&body), "Move").await
    }

    /// Delete an item by path.
    pub async fn delete(&self, path: &DrivePath) -> Result<()> {
        let response = self
            .send(self.http.delete(self.item_url(path)), "Delete")
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

/// Percent-encode each segment and join with '/'.
fn encode_path(path: &DrivePath) -> String {
    path.segments()
        .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    response
        .json()
        .await
        .map_err(|e| Error::Network(format!("Unreadable Graph response: {}", e)))
}

/// Turn a non-2xx response into a typed error using the Graph error body.
async fn error_from_response(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let (code, message) = match serde_json::from_str::<GraphErrorBody>(&body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message),
        Err(_) => (None, None),
    };

    let message = message
        .filter(|m| !m.is_empty())
        .or_else(|| (!body.is_empty()).then(|| body.clone()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

    tracing::debug!("Graph error {}: {:?} {}", status, code, message);
    Error::from_graph(status.as_u16(), code, message)
}
