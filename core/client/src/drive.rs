//! Path-addressed OneDrive operations on top of the Graph client.

use bytes::Bytes;
use futures::{stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graphdrive_common::{DrivePath, Error, Result, SecretString};

use crate::auth::{AuthManager, AuthState, AuthorizationPrompt, TokenManager, Tokens};
use crate::client::{GraphClient, SIMPLE_UPLOAD_LIMIT};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::settings::Settings;
use crate::types::{ConflictBehavior, DriveInfo, FolderListing, Metadata};

/// A signed-in user's OneDrive.
///
/// Every operation makes sure the access token is fresh (refreshing it
/// silently when it is about to expire), attaches it, performs one Graph
/// call, and maps failures to [`Error`].
pub struct OneDrive {
    settings: Settings,
    client: GraphClient,
    token_manager: Arc<TokenManager>,
    connected: AtomicBool,
}

impl OneDrive {
    /// Create a client from settings.
    ///
    /// A non-empty `refresh_token` in the settings makes the client start
    /// out authenticated with an expired access token; otherwise it starts
    /// unauthenticated.
    ///
    /// # Errors
    /// - Settings fail validation
    /// - HTTP clients cannot be built
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let auth_manager = AuthManager::new(settings.auth_config())?;
        let token_manager = Arc::new(TokenManager::with_refresh_token(
            auth_manager,
            settings.refresh_token.clone(),
        ));
        Self::from_parts(settings, token_manager)
    }

    /// Create a client from settings and tokens obtained elsewhere.
    pub fn with_tokens(settings: Settings, tokens: Tokens) -> Result<Self> {
        settings.validate()?;
        let auth_manager = AuthManager::new(settings.auth_config())?;
        let token_manager = Arc::new(TokenManager::new(auth_manager, Some(tokens)));
        Self::from_parts(settings, token_manager)
    }

    fn from_parts(settings: Settings, token_manager: Arc<TokenManager>) -> Result<Self> {
        let client = GraphClient::new(
            token_manager.clone(),
            &settings.browse_url,
            settings.request_timeout(),
        )?;

        Ok(Self {
            settings,
            client,
            token_manager,
            connected: AtomicBool::new(false),
        })
    }

    /// Obtain fresh tokens: refresh-token grant when a refresh token is
    /// known, interactive grant through `prompt` otherwise.
    ///
    /// # Errors
    /// - `Authentication` when the refresh token is rejected; the client is
    ///   unauthenticated afterwards
    pub async fn authenticate(&self, prompt: &dyn AuthorizationPrompt) -> Result<()> {
        self.token_manager.authenticate(prompt).await
    }

    /// Authenticate if needed and make sure the drive answers.
    ///
    /// The drive lookup is retried up to `number_retry_connection` times on
    /// transient failures.
    pub async fn connect(&self, prompt: &dyn AuthorizationPrompt) -> Result<DriveInfo> {
        if self.state().await != AuthState::Valid {
            self.authenticate(prompt).await?;
        }

        let retry = RetryExecutor::new(
            RetryConfig::new(self.settings.number_retry_connection)
                .with_initial_delay(Duration::from_millis(500)),
        );

        let drive = retry
            .execute("Drive lookup", || self.client.get_drive())
            .await
            .inspect_err(|_| self.connected.store(false, Ordering::SeqCst))?;

        self.connected.store(true, Ordering::SeqCst);

        match drive.quota.as_ref().and_then(|q| q.remaining) {
            Some(remaining) => {
                tracing::info!("Connected to drive {} ({} bytes free)", drive.id, remaining)
            }
            None => tracing::info!("Connected to drive {}", drive.id),
        }

        Ok(drive)
    }

    /// Whether the last [`OneDrive::connect`] reached the drive.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current position in the token lifecycle.
    pub async fn state(&self) -> AuthState {
        self.token_manager.state().await
    }

    /// Current tokens, if authenticated.
    pub async fn tokens(&self) -> Option<Tokens> {
        self.token_manager.get_tokens().await
    }

    /// Current refresh token; it rotates, so persist it after each run.
    pub async fn refresh_token(&self) -> Option<SecretString> {
        self.token_manager.refresh_token().await
    }

    /// Settings with the current refresh token, ready to be saved.
    pub async fn settings_snapshot(&self) -> Settings {
        let mut settings = self.settings.clone();
        settings.refresh_token = self.refresh_token().await.unwrap_or_default();
        settings
    }

    /// Whether the refresh token differs from the one in [`OneDrive::settings`],
    /// i.e. it rotated, was obtained interactively, or was dropped after
    /// being rejected. Persist [`OneDrive::settings_snapshot`] when it did.
    pub async fn credentials_changed(&self) -> bool {
        self.refresh_token().await.unwrap_or_default() != self.settings.refresh_token
    }

    /// Settings this client was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The underlying Graph client.
    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    /// Download a file.
    ///
    /// # Errors
    /// - `NotFound` if nothing exists at `path`
    /// - `Authentication` if the token is rejected
    pub async fn download(&self, path: &DrivePath) -> Result<Vec<u8>> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot download the drive root".to_string()));
        }
        self.client.download(path).await
    }

    /// Upload a file, replacing whatever is at `path`.
    pub async fn upload(&self, path: &DrivePath, data: Vec<u8>) -> Result<Metadata> {
        self.upload_with(path, data, ConflictBehavior::Replace).await
    }

    /// Upload a file with an explicit conflict behavior.
    ///
    /// Payloads above 4 MiB go through an upload session.
    ///
    /// # Errors
    /// - `Conflict` if `conflict` is `Fail` and the name is taken
    /// - `QuotaExceeded` if the drive is full
    pub async fn upload_with(
        &self,
        path: &DrivePath,
        data: Vec<u8>,
        conflict: ConflictBehavior,
    ) -> Result<Metadata> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot upload to the drive root itself".to_string()));
        }

        let size = data.len();
        let data = Bytes::from(data);

        let item = if size > SIMPLE_UPLOAD_LIMIT {
            self.client.upload_large(path, data, conflict).await?
        } else {
            self.client.upload_simple(path, data, conflict).await?
        };

        tracing::info!("Uploaded {} ({} bytes)", path, size);
        Ok(item.into())
    }

    /// Get metadata for a path.
    ///
    /// # Errors
    /// - `NotFound` if nothing exists at `path`
    pub async fn get_metadata(&self, path: &DrivePath) -> Result<Metadata> {
        Ok(self.client.get_item(path).await?.into())
    }

    /// List the files and folders directly inside `dir`.
    pub async fn list(&self, dir: &DrivePath) -> Result<FolderListing> {
        Ok(self.client.list_children(dir).await?.into_iter().collect())
    }

    /// Create a folder named `name` inside `parent`.
    ///
    /// # Errors
    /// - `Conflict` if an item with that name exists
    pub async fn make_dir(&self, parent: &DrivePath, name: &str) -> Result<Metadata> {
        let target = parent.join(name)?;
        let item = self.client.create_folder(parent, name).await?;
        tracing::info!("Created folder {}", target);
        Ok(item.into())
    }

    /// Move the item at `from` into the folder `to_folder`.
    ///
    /// Moving a folder carries its contents along, so `/a/src` moved to
    /// `/b` ends up as `/b/src`.
    pub async fn move_item(&self, from: &DrivePath, to_folder: &DrivePath) -> Result<Metadata> {
        if from.is_root() {
            return Err(Error::InvalidInput("Cannot move the drive root".to_string()));
        }

        let item = self.client.get_item(from).await?;
        let destination = self.client.get_item(to_folder).await?;
        if !destination.is_folder() {
            return Err(Error::InvalidInput(format!(
                "Move target is not a folder: {}",
                to_folder
            )));
        }

        let moved = self.client.move_item(&item.id, &destination.id).await?;
        tracing::info!("Moved {} into {}", from, to_folder);
        Ok(moved.into())
    }

    /// Delete the item at `path`.
    pub async fn delete(&self, path: &DrivePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot delete the drive root".to_string()));
        }
        self.client.delete(path).await?;
        tracing::info!("Deleted {}", path);
        Ok(())
    }

    /// Upload local files into one remote folder, keeping their names.
    ///
    /// At most `max_threads` uploads run at once. Every file is attempted;
    /// if any fails the call returns `Error::Transfer` naming each failure.
    pub async fn upload_files(
        &self,
        files: &[PathBuf],
        remote_dir: &DrivePath,
    ) -> Result<Vec<Metadata>> {
        let results: Vec<(String, Result<Metadata>)> = stream::iter(files)
            .map(|file| async move {
                let label = file.display().to_string();
                (label, self.upload_local_file(file, remote_dir).await)
            })
            .buffer_unordered(self.settings.max_threads)
            .collect()
            .await;

        collect_batch(results, "Could not upload all files")
    }

    async fn upload_local_file(&self, file: &Path, remote_dir: &DrivePath) -> Result<Metadata> {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("Not a file name: {}", file.display())))?;

        let data = match tokio::fs::read(file).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "Local file does not exist: {}",
                    file.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        self.upload(&remote_dir.join(name)?, data).await
    }

    /// Download the files of a remote folder into `local_dir`.
    ///
    /// `only` restricts the download to the file with that name. The local
    /// folder is created if needed; subfolders are not descended into. At
    /// most `max_threads` downloads run at once, and failures aggregate
    /// into `Error::Transfer`.
    pub async fn download_folder(
        &self,
        remote_dir: &DrivePath,
        local_dir: &Path,
        only: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(local_dir).await?;

        let listing = self.list(remote_dir).await?;
        let targets: Vec<Metadata> = listing
            .files
            .into_iter()
            .filter(|f| only.map_or(true, |name| f.name == name))
            .collect();

        if let Some(name) = only {
            if targets.is_empty() {
                return Err(Error::NotFound(format!("{} not found in {}", name, remote_dir)));
            }
        }

        let results: Vec<(String, Result<PathBuf>)> = stream::iter(targets)
            .map(|meta| async move {
                let result = self.download_item(&meta, local_dir).await;
                (meta.name, result)
            })
            .buffer_unordered(self.settings.max_threads)
            .collect()
            .await;

        collect_batch(results, "Could not download all files")
    }

    async fn download_item(&self, meta: &Metadata, local_dir: &Path) -> Result<PathBuf> {
        let content = self.client.download_by_id(&meta.id).await?;
        let target = local_dir.join(&meta.name);

        tokio::fs::write(&target, &content).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Could not write {}: {}", target.display(), e),
            ))
        })?;

        tracing::info!("Downloaded {} ({} bytes)", target.display(), content.len());
        Ok(target)
    }
}

/// Split batch results; any failure turns the whole batch into an error
/// that lists every failed item.
fn collect_batch<T>(results: Vec<(String, Result<T>)>, context: &str) -> Result<Vec<T>> {
    let mut succeeded = Vec::with_capacity(results.len());
    let mut failures = Vec::new();

    for (label, result) in results {
        match result {
            Ok(value) => succeeded.push(value),
            Err(e) => {
                tracing::warn!("{} failed: {}", label, e);
                failures.push(format!("{}: {}", label, e));
            }
        }
    }

    if failures.is_empty() {
        Ok(succeeded)
    } else {
        failures.sort();
        Err(Error::Transfer(format!("{}: {}", context, failures.join(". "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        Settings::new(
            "client",
            "http://localhost:8080/callback",
            vec!["Files.ReadWrite".to_string(), "offline_access".to_string()],
        )
    }

    #[tokio::test]
    async fn test_new_without_refresh_token_is_unauthenticated() {
        let drive = OneDrive::new(test_settings()).unwrap();
        assert_eq!(drive.state().await, AuthState::Unauthenticated);
        assert!(!drive.is_connected());
        assert!(drive.refresh_token().await.is_none());
    }

    #[tokio::test]
    async fn test_new_with_refresh_token_starts_expired() {
        let mut settings = test_settings();
        settings.refresh_token = SecretString::new("persisted");

        let drive = OneDrive::new(settings).unwrap();
        assert_eq!(drive.state().await, AuthState::Expired);
        assert_eq!(drive.settings_snapshot().await.refresh_token.expose(), "persisted");
        assert!(!drive.credentials_changed().await);
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let mut settings = test_settings();
        settings.permissions = vec!["Files.Read".to_string()];
        assert!(matches!(OneDrive::new(settings), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_root_operations_rejected() {
        let drive = OneDrive::new(test_settings()).unwrap();
        let root = DrivePath::root();

        assert!(matches!(
            drive.upload(&root, b"x".to_vec()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(drive.download(&root).await, Err(Error::InvalidInput(_))));
        assert!(matches!(drive.delete(&root).await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_operations_require_authentication() {
        let drive = OneDrive::new(test_settings()).unwrap();
        let path = DrivePath::parse("/docs/a.txt").unwrap();

        assert!(matches!(
            drive.get_metadata(&path).await,
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn test_collect_batch_all_ok() {
        let results = vec![("a".to_string(), Ok(1)), ("b".to_string(), Ok(2))];
        assert_eq!(collect_batch(results, "ctx").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_collect_batch_lists_failures() {
        let results: Vec<(String, Result<i32>)> = vec![
            ("b.txt".to_string(), Err(Error::NotFound("gone".to_string()))),
            ("ok.txt".to_string(), Ok(1)),
            ("a.txt".to_string(), Err(Error::Network("reset".to_string()))),
        ];

        match collect_batch(results, "Could not upload all files") {
            Err(Error::Transfer(msg)) => {
                assert!(msg.starts_with("Could not upload all files: a.txt"));
                assert!(msg.contains("b.txt: Not found: gone"));
                assert!(!msg.contains("ok.txt"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
