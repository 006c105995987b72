//! Cloud backend: chunk operations against the provider's file API.
//!
//! Chunks are stored as individual files named by chunk id inside a fixed
//! application folder. Stores overwrite (delete-then-create) so re-uploads
//! never accumulate duplicates, and deletes are idempotent: an absent file
//! is a success. The per-user OAuth token never leaves this module; expired
//! access tokens are refreshed with the refresh-token grant when client
//! credentials are configured.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

use scatter_core::{Error, Result};

use super::Backend;
use crate::db::{CloudToken, Database};

/// Application folder that holds all chunk files.
const FOLDER_NAME: &str = "Scatterdrive Data";

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=multipart";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Shared cloud API client. Cheap to clone; the folder id cache is per user.
#[derive(Clone)]
pub struct CloudDrive {
    client: Client,
    db: Database,
    client_id: Option<String>,
    client_secret: Option<String>,
    /// user_id → resolved application folder id.
    folder_cache: Arc<DashMap<String, String>>,
}

impl CloudDrive {
    pub fn new(db: Database, client_id: Option<String>, client_secret: Option<String>) -> Self {
        Self {
            client: Client::new(),
            db,
            client_id,
            client_secret,
            folder_cache: Arc::new(DashMap::new()),
        }
    }

    /// A live access token for the user, refreshing if expired.
    async fn access_token(&self, user_id: &str) -> Result<String> {
        let token = self
            .db
            .get_cloud_token(user_id)?
            .ok_or_else(|| Error::Cloud(format!("no cloud token for user {user_id}")))?;

        if !token.is_expired(Utc::now()) {
            return Ok(token.access_token);
        }
        self.refresh_token(user_id, &token).await
    }

    async fn refresh_token(&self, user_id: &str, token: &CloudToken) -> Result<String> {
        let (client_id, client_secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => return Err(Error::Cloud("token expired and no client credentials".into())),
        };
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Cloud("token expired and no refresh token".into()))?;

        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(Error::cloud)?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!("token refresh failed: {}", resp.status())));
        }
        let refreshed: RefreshResponse = resp.json().await.map_err(Error::cloud)?;

        let updated = CloudToken {
            access_token: refreshed.access_token.clone(),
            // Omitted in refresh responses; the store keeps the old one.
            refresh_token: None,
            token_type: refreshed.token_type.unwrap_or_else(|| "Bearer".into()),
            expiry: refreshed
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        };
        self.db.save_cloud_token(user_id, &updated)?;
        tracing::debug!(user_id = user_id, "Refreshed cloud access token");
        Ok(updated.access_token)
    }

    /// Resolve (or create) the application folder for a user.
    async fn folder_id(&self, user_id: &str, token: &str) -> Result<String> {
        if let Some(cached) = self.folder_cache.get(user_id) {
            return Ok(cached.clone());
        }

        let query = format!(
            "name = '{FOLDER_NAME}' and mimeType = '{FOLDER_MIME}' and trashed = false"
        );
        let list: FileList = self
            .api_json(
                self.client
                    .get(FILES_URL)
                    .query(&[("q", query.as_str()), ("fields", "files(id)")]),
                token,
            )
            .await?;

        let id = match list.files.into_iter().next() {
            Some(folder) => folder.id,
            None => {
                let created: FileRef = self
                    .api_json(
                        self.client
                            .post(format!("{FILES_URL}?fields=id"))
                            .json(&serde_json::json!({
                                "name": FOLDER_NAME,
                                "mimeType": FOLDER_MIME,
                            })),
                        token,
                    )
                    .await?;
                tracing::info!(user_id = user_id, "Created cloud application folder");
                created.id
            }
        };

        self.folder_cache.insert(user_id.to_string(), id.clone());
        Ok(id)
    }

    /// Find a chunk file by name inside the folder.
    async fn find_file(&self, token: &str, name: &str, folder_id: &str) -> Result<Option<String>> {
        let query = format!("name = '{name}' and '{folder_id}' in parents and trashed = false");
        let list: FileList = self
            .api_json(
                self.client
                    .get(FILES_URL)
                    .query(&[("q", query.as_str()), ("fields", "files(id)")]),
                token,
            )
            .await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn api_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        token: &str,
    ) -> Result<T> {
        let resp = req.bearer_auth(token).send().await.map_err(Error::cloud)?;
        if !resp.status().is_success() {
            return Err(Error::Cloud(format!("cloud API error: {}", resp.status())));
        }
        resp.json().await.map_err(Error::cloud)
    }

    /// Upload chunk bytes as a file named by chunk id, overwriting any
    /// previous copy.
    pub async fn upload_chunk(&self, user_id: &str, chunk_id: &str, data: Vec<u8>) -> Result<()> {
        let token = self.access_token(user_id).await?;
        let folder = self.folder_id(user_id, &token).await?;

        // Delete-then-create keeps the name unique in the folder.
        if let Some(existing) = self.find_file(&token, chunk_id, &folder).await? {
            let _ = self.delete_by_id(&token, &existing).await;
        }

        // multipart/related: a JSON metadata part then the media part.
        let boundary = "scatter-chunk-upload";
        let metadata = serde_json::json!({ "name": chunk_id, "parents": [folder] });
        let mut body =
            format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n")
                .into_bytes();
        body.extend_from_slice(&data);
        body.extend_from_slice(format!("\r\n--{boundary}--").as_bytes());

        let resp = self
            .client
            .post(UPLOAD_URL)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
            .body(body)
            .send()
            .await
            .map_err(Error::cloud)?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!("chunk upload failed: {}", resp.status())));
        }
        Ok(())
    }

    /// Download chunk bytes by chunk id.
    pub async fn download_chunk(&self, user_id: &str, chunk_id: &str) -> Result<Vec<u8>> {
        let token = self.access_token(user_id).await?;
        let folder = self.folder_id(user_id, &token).await?;
        let file_id = self
            .find_file(&token, chunk_id, &folder)
            .await?
            .ok_or_else(|| Error::Cloud(format!("chunk {chunk_id} not in cloud folder")))?;

        let resp = self
            .client
            .get(format!("{FILES_URL}/{file_id}"))
            .query(&[("alt", "media")])
            .bearer_auth(&token)
            .send()
            .await
            .map_err(Error::cloud)?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!("chunk download failed: {}", resp.status())));
        }
        let bytes = resp.bytes().await.map_err(Error::cloud)?;
        Ok(bytes.to_vec())
    }

    /// Delete a chunk file. Absent chunk counts as success.
    pub async fn delete_chunk(&self, user_id: &str, chunk_id: &str) -> Result<()> {
        let token = self.access_token(user_id).await?;
        let folder = self.folder_id(user_id, &token).await?;
        match self.find_file(&token, chunk_id, &folder).await? {
            Some(file_id) => self.delete_by_id(&token, &file_id).await,
            None => Ok(()),
        }
    }

    async fn delete_by_id(&self, token: &str, file_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{FILES_URL}/{file_id}"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Error::cloud)?;
        // 404 means someone beat us to it; that is the outcome we wanted.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Cloud(format!("cloud delete failed: {}", resp.status())));
        }
        Ok(())
    }
}

/// Per-user adapter view over [`CloudDrive`].
pub struct CloudBackend {
    drive: CloudDrive,
    user_id: String,
}

impl CloudBackend {
    pub fn new(drive: CloudDrive, user_id: &str) -> Self {
        Self {
            drive,
            user_id: user_id.to_string(),
        }
    }
}

#[async_trait]
impl Backend for CloudBackend {
    async fn put(&self, chunk_id: &str, data: Vec<u8>) -> Result<()> {
        // The API call succeeding IS the ack for a cloud store.
        self.drive.upload_chunk(&self.user_id, chunk_id, data).await
    }

    async fn get(&self, chunk_id: &str) -> Result<Vec<u8>> {
        self.drive.download_chunk(&self.user_id, chunk_id).await
    }

    async fn remove(&self, chunk_id: &str) -> Result<()> {
        self.drive.delete_chunk(&self.user_id, chunk_id).await
    }
}
