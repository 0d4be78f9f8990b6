//! OneDrive client for the Microsoft Graph REST API.
//!
//! This crate wraps the handful of Graph endpoints needed to move files in
//! and out of a user's drive, plus the OAuth2 plumbing that keeps a bearer
//! token valid:
//! - Interactive authorization-code grant (PKCE) and refresh-token grant
//! - Silent refresh shortly before the access token expires
//! - Path-addressed upload, download, metadata, listing and moves
//! - Typed errors mapped from Graph error bodies

pub mod auth;
pub mod client;
pub mod drive;
pub mod retry;
pub mod settings;
pub mod types;

pub use auth::{
    extract_code, AuthConfig, AuthManager, AuthState, AuthorizationPrompt, AuthorizationRequest,
    TokenManager, Tokens,
};
pub use client::GraphClient;
pub use drive::OneDrive;
pub use retry::{RetryConfig, RetryExecutor};
pub use settings::Settings;
pub use types::{ConflictBehavior, DriveInfo, DriveItem, FolderListing, Metadata};
