//! OAuth2 authentication and token management for the Microsoft identity platform.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use url::Url;

use graphdrive_common::{Error, Result, SecretString};

/// Seconds before expiry at which an access token is treated as expired.
pub const EXPIRY_MARGIN_SECS: u64 = 300;

/// Lifetime assumed when the token response carries no `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// OAuth2 tokens with expiration tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    /// Access token for Graph requests.
    pub access_token: SecretString,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: SecretString,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Tokens restored from a persisted refresh token only.
    ///
    /// The access token is empty, which counts as expired, so the first
    /// use triggers a refresh.
    pub fn from_refresh_token(refresh_token: SecretString) -> Self {
        Self {
            access_token: SecretString::default(),
            refresh_token,
            expires_at: Utc::now(),
        }
    }

    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        self.access_token.is_empty()
            || self.expires_at < Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS as i64)
    }
}

/// Where the client stands in the token lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No refresh token; an interactive grant is required.
    Unauthenticated,
    /// Access token present and not about to expire.
    Valid,
    /// Access token missing or expiring; the next call refreshes silently.
    Expired,
}

/// Configuration for OAuth2 authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Application (client) ID.
    pub client_id: String,
    /// Client secret for confidential clients.
    #[serde(default)]
    pub client_secret: Option<SecretString>,
    /// Redirect URL for the authorization-code callback.
    pub redirect_url: String,
    /// Authorization endpoint.
    pub authorize_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Scopes requested on authorization and refresh.
    pub scopes: Vec<String>,
    /// Cap (seconds) on the lifetime trusted from a token response.
    pub max_token_lifetime: u64,
}

/// A pending interactive authorization.
///
/// Holds the PKCE verifier and CSRF state that the code exchange needs
/// once the user comes back from the browser.
#[derive(Debug)]
pub struct AuthorizationRequest {
    /// URL the user opens to sign in and consent.
    pub url: Url,
    state: CsrfToken,
    pkce_verifier: PkceCodeVerifier,
}

impl AuthorizationRequest {
    /// CSRF state expected back on the redirect.
    pub fn state(&self) -> &str {
        self.state.secret()
    }
}

/// Caller-supplied step of the interactive grant.
///
/// Implementations show the authorize URL to the user (open a browser,
/// print it, ...) and return either the full URL the browser was
/// redirected to or the bare authorization code.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    async fn authorize(&self, authorize_url: &Url) -> Result<String>;
}

/// Pull the authorization code out of a prompt answer.
///
/// Accepts the redirect URL (checking `state` and surfacing `error`) or a
/// bare code.
pub fn extract_code(answer: &str, expected_state: &str) -> Result<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Err(Error::InvalidInput(
            "No authorization code provided".to_string(),
        ));
    }

    let redirect = match Url::parse(answer) {
        Ok(url) => url,
        Err(_) => return Ok(answer.to_string()),
    };

    let params: HashMap<String, String> = redirect.query_pairs().into_owned().collect();

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(String::as_str)
            .unwrap_or("");
        return Err(Error::Authentication(format!(
            "Authorization denied: {} {}",
            error, description
        )));
    }

    match params.get("state") {
        Some(state) if state == expected_state => {}
        Some(_) => {
            return Err(Error::Authentication(
                "Authorization state mismatch (possible CSRF)".to_string(),
            ))
        }
        None => {
            return Err(Error::Authentication(
                "Redirect URL carries no state parameter".to_string(),
            ))
        }
    }

    params.get("code").cloned().ok_or_else(|| {
        Error::Authentication("Redirect URL carries no authorization code".to_string())
    })
}

/// OAuth2 authentication manager for the Microsoft identity platform.
pub struct AuthManager {
    client: ConfiguredClient,
    http: oauth2::reqwest::Client,
    config: AuthConfig,
}

impl AuthManager {
    /// Create a new authentication manager.
    ///
    /// # Errors
    /// - Any endpoint or the redirect URL fails to parse
    /// - The token HTTP client cannot be built
    pub fn new(config: AuthConfig) -> Result<Self> {
        let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(config.authorize_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            )
            // The identity platform expects client_id (and secret) in the form body.
            .set_auth_type(AuthType::RequestBody);

        if let Some(secret) = &config.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.expose().to_string()));
        }

        // Token endpoints must not redirect.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create token client: {}", e)))?;

        Ok(Self {
            client,
            http,
            config,
        })
    }

    /// Start an interactive authorization.
    pub fn authorization_request(&self) -> AuthorizationRequest {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let (url, state) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.config.scopes.iter().cloned().map(Scope::new))
            .set_pkce_challenge(pkce_challenge)
            .url();

        AuthorizationRequest {
            url,
            state,
            pkce_verifier,
        }
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    /// - Code rejected by the identity platform
    /// - No refresh token in the answer (scope `offline_access` missing)
    /// - Network errors
    pub async fn exchange_code(&self, code: &str, request: AuthorizationRequest) -> Result<Tokens> {
        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(request.pkce_verifier)
            .request_async(&self.http)
            .await
            .map_err(|e| token_error("Token exchange failed", e))?;

        let refresh_token = token_result
            .refresh_token()
            .map(|t| SecretString::new(t.secret().clone()))
            .ok_or_else(|| {
                Error::Authentication(
                    "No refresh token received. Ensure 'offline_access' was requested."
                        .to_string(),
                )
            })?;

        self.build_tokens(&token_result, refresh_token)
    }

    /// Refresh an access token using the refresh token.
    ///
    /// # Errors
    /// - Invalid, expired or revoked refresh token
    /// - Network errors
    pub async fn refresh_token(&self, refresh_token: &SecretString) -> Result<Tokens> {
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose().to_string()))
            .add_scopes(self.config.scopes.iter().cloned().map(Scope::new))
            .request_async(&self.http)
            .await
            .map_err(|e| token_error("Token refresh failed", e))?;

        // The identity platform normally rotates the refresh token.
        let new_refresh_token = token_result
            .refresh_token()
            .map(|t| SecretString::new(t.secret().clone()))
            .unwrap_or_else(|| refresh_token.clone());

        self.build_tokens(&token_result, new_refresh_token)
    }

    fn build_tokens<TR: TokenResponse>(
        &self,
        token_result: &TR,
        refresh_token: SecretString,
    ) -> Result<Tokens> {
        let access_token = token_result.access_token().secret();
        if access_token.is_empty() {
            return Err(Error::Authentication(
                "Identity platform returned an empty access token".to_string(),
            ));
        }

        let cap = std::time::Duration::from_secs(self.config.max_token_lifetime);
        let expires_in = token_result
            .expires_in()
            .unwrap_or_else(|| std::time::Duration::from_secs(DEFAULT_TOKEN_LIFETIME_SECS))
            .min(cap);

        let expires_at =
            Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));

        Ok(Tokens {
            access_token: SecretString::new(access_token.clone()),
            refresh_token,
            expires_at,
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

/// Classify a failed token request.
///
/// Only a grant the identity platform refuses (`invalid_grant`, or an
/// extension code such as `interaction_required`) is an `Authentication`
/// error; it is the one failure after which the refresh token is dropped.
/// Client misconfiguration is `Config`. Every other failure, an HTML
/// outage page or an empty error body included, is `Network` and leaves
/// the tokens alone.
fn token_error<RE>(context: &str, err: RequestTokenError<RE, BasicErrorResponse>) -> Error
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            let detail = response
                .error_description()
                .cloned()
                .unwrap_or_else(|| response.error().to_string());

            match response.error() {
                BasicErrorResponseType::InvalidGrant => {
                    Error::Authentication(format!("{}: {}", context, detail))
                }
                BasicErrorResponseType::Extension(code)
                    if matches!(code.as_str(), "server_error" | "temporarily_unavailable") =>
                {
                    Error::Network(format!("{}: {}", context, detail))
                }
                BasicErrorResponseType::Extension(_) => {
                    Error::Authentication(format!("{}: {}", context, detail))
                }
                other => Error::Config(format!(
                    "{}: identity platform refused the client ({}): {}",
                    context, other, detail
                )),
            }
        }
        RequestTokenError::Request(e) => Error::Network(format!("{}: {}", context, e)),
        RequestTokenError::Parse(e, body) => Error::Network(format!(
            "{}: unreadable answer from the token endpoint ({}): {}",
            context,
            e,
            String::from_utf8_lossy(&body).chars().take(200).collect::<String>()
        )),
        RequestTokenError::Other(msg) => Error::Network(format!("{}: {}", context, msg)),
    }
}

/// Token manager that automatically refreshes expired tokens.
///
/// `None` means unauthenticated: there is no refresh token to mint access
/// tokens from, and only [`TokenManager::authenticate`] gets out of it.
pub struct TokenManager {
    auth_manager: AuthManager,
    tokens: RwLock<Option<Tokens>>,
}

impl TokenManager {
    /// Create a new token manager with initial tokens.
    pub fn new(auth_manager: AuthManager, tokens: Option<Tokens>) -> Self {
        Self {
            auth_manager,
            tokens: RwLock::new(tokens),
        }
    }

    /// Create a token manager seeded from a persisted refresh token.
    ///
    /// An empty refresh token leaves the manager unauthenticated.
    pub fn with_refresh_token(auth_manager: AuthManager, refresh_token: SecretString) -> Self {
        let tokens = if refresh_token.is_empty() {
            None
        } else {
            Some(Tokens::from_refresh_token(refresh_token))
        };
        Self::new(auth_manager, tokens)
    }

    /// Current position in the token lifecycle.
    pub async fn state(&self) -> AuthState {
        match self.tokens.read().await.as_ref() {
            None => AuthState::Unauthenticated,
            Some(tokens) if tokens.is_expired() => AuthState::Expired,
            Some(_) => AuthState::Valid,
        }
    }

    /// Obtain fresh tokens.
    ///
    /// With a refresh token present this always exchanges it, without one
    /// it runs the interactive grant through `prompt`. A rejected refresh
    /// token is an error here; the manager drops back to unauthenticated
    /// and the next call goes interactive.
    pub async fn authenticate(&self, prompt: &dyn AuthorizationPrompt) -> Result<()> {
        let mut tokens = self.tokens.write().await;

        let new_tokens = match tokens.as_ref().map(|t| t.refresh_token.clone()) {
            Some(refresh_token) => {
                tracing::info!("Exchanging refresh token for a new access token");
                self.refresh_or_reset(&mut tokens, &refresh_token).await?
            }
            None => {
                tracing::info!("No refresh token available, starting interactive grant");
                let request = self.auth_manager.authorization_request();
                let answer = prompt.authorize(&request.url).await?;
                let code = extract_code(&answer, request.state())?;
                self.auth_manager.exchange_code(&code, request).await?
            }
        };

        *tokens = Some(new_tokens);
        Ok(())
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Errors
    /// - Not authenticated
    /// - Token refresh failed
    pub async fn get_access_token(&self) -> Result<SecretString> {
        let tokens = self.tokens.read().await;

        match tokens.as_ref() {
            None => return Err(not_authenticated()),
            Some(t) if !t.is_expired() => return Ok(t.access_token.clone()),
            Some(_) => {}
        }

        drop(tokens);

        // Need to refresh
        let mut tokens = self.tokens.write().await;

        // Double-check after acquiring write lock
        let refresh_token = match tokens.as_ref() {
            None => return Err(not_authenticated()),
            Some(t) if !t.is_expired() => return Ok(t.access_token.clone()),
            Some(t) => t.refresh_token.clone(),
        };

        tracing::info!("Refreshing expired access token");

        let new_tokens = self.refresh_or_reset(&mut tokens, &refresh_token).await?;
        let access_token = new_tokens.access_token.clone();
        *tokens = Some(new_tokens);

        Ok(access_token)
    }

    async fn refresh_or_reset(
        &self,
        tokens: &mut Option<Tokens>,
        refresh_token: &SecretString,
    ) -> Result<Tokens> {
        match self.auth_manager.refresh_token(refresh_token).await {
            Ok(new_tokens) => Ok(new_tokens),
            // Only a refused grant invalidates the refresh token; anything
            // else keeps it for the next attempt.
            Err(Error::Authentication(msg)) => {
                tracing::warn!("Refresh token rejected, interactive sign-in required");
                *tokens = None;
                Err(Error::Authentication(msg))
            }
            Err(e) => {
                tracing::warn!("Token refresh failed, keeping refresh token: {}", e);
                Err(e)
            }
        }
    }

    /// Get the current tokens.
    pub async fn get_tokens(&self) -> Option<Tokens> {
        self.tokens.read().await.clone()
    }

    /// Current refresh token, for the caller to persist.
    pub async fn refresh_token(&self) -> Option<SecretString> {
        self.tokens
            .read()
            .await
            .as_ref()
            .map(|t| t.refresh_token.clone())
    }

    /// Update tokens (e.g., restored from elsewhere).
    pub async fn update_tokens(&self, tokens: Option<Tokens>) {
        *self.tokens.write().await = tokens;
    }

    /// The underlying authentication manager.
    pub fn auth_manager(&self) -> &AuthManager {
        &self.auth_manager
    }
}

fn not_authenticated() -> Error {
    Error::Authentication("Not authenticated; interactive sign-in required".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig {
            client_id: "test_id".to_string(),
            client_secret: None,
            redirect_url: "http://localhost:8080/callback".to_string(),
            authorize_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
                .to_string(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            scopes: vec!["Files.ReadWrite".to_string(), "offline_access".to_string()],
            max_token_lifetime: 3600,
        }
    }

    fn tokens_expiring_in(delta: Duration) -> Tokens {
        Tokens {
            access_token: SecretString::new("test"),
            refresh_token: SecretString::new("refresh"),
            expires_at: Utc::now() + delta,
        }
    }

    #[test]
    fn test_expiry_margin() {
        assert!(tokens_expiring_in(Duration::hours(-1)).is_expired());

        let margin = EXPIRY_MARGIN_SECS as i64;
        assert!(tokens_expiring_in(Duration::seconds(margin - 30)).is_expired());
        assert!(!tokens_expiring_in(Duration::seconds(margin + 60)).is_expired());
    }

    #[test]
    fn test_refresh_only_tokens_need_refresh() {
        let tokens = Tokens::from_refresh_token(SecretString::new("refresh"));
        assert!(tokens.is_expired());
        assert!(tokens.access_token.is_empty());
    }

    #[test]
    fn test_public_client_config_has_no_secret() {
        let json = r#"{
            "client_id": "app",
            "redirect_url": "http://localhost:8080/callback",
            "authorize_url": "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            "token_url": "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            "scopes": ["offline_access"],
            "max_token_lifetime": 1800
        }"#;
        let config: AuthConfig = serde_json::from_str(json).unwrap();

        assert!(config.client_secret.is_none());
        assert!(AuthManager::new(config).is_ok());
    }

    #[test]
    fn test_auth_manager_rejects_bad_url() {
        let mut config = test_config();
        config.token_url = "::not a url".to_string();
        assert!(matches!(
            AuthManager::new(config),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_authorize_url_carries_pkce_and_state() {
        let manager = AuthManager::new(test_config()).unwrap();
        let request = manager.authorization_request();
        let url = request.url.to_string();

        assert!(url.contains("login.microsoftonline.com"));
        assert!(url.contains("client_id=test_id"));
        assert!(url.contains("offline_access"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", request.state())));
        assert!(!request.state().is_empty());
    }

    #[test]
    fn test_extract_code_from_redirect() {
        let code = extract_code(
            "http://localhost:8080/callback?code=M.C507_abc&state=xyz",
            "xyz",
        )
        .unwrap();
        assert_eq!(code, "M.C507_abc");
    }

    #[test]
    fn test_extract_code_bare() {
        assert_eq!(extract_code("  M.C507_abc\n", "xyz").unwrap(), "M.C507_abc");
        assert!(extract_code("   ", "xyz").is_err());
    }

    #[test]
    fn test_extract_code_state_mismatch() {
        let err = extract_code("http://localhost:8080/callback?code=abc&state=evil", "xyz")
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_extract_code_denied() {
        let err = extract_code(
            "http://localhost:8080/callback?error=access_denied&error_description=user+cancelled&state=xyz",
            "xyz",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Authentication(msg) if msg.contains("access_denied")));
    }

    type TokenRequestError = RequestTokenError<std::io::Error, BasicErrorResponse>;

    fn refused(kind: BasicErrorResponseType) -> TokenRequestError {
        RequestTokenError::ServerResponse(BasicErrorResponse::new(
            kind,
            Some("AADSTS700082: expired".to_string()),
            None,
        ))
    }

    #[test]
    fn test_refused_grant_is_authentication() {
        let err = token_error("Refresh", refused(BasicErrorResponseType::InvalidGrant));
        assert!(matches!(err, Error::Authentication(msg) if msg.contains("AADSTS700082")));

        let code = BasicErrorResponseType::Extension("interaction_required".to_string());
        assert!(matches!(
            token_error("Refresh", refused(code)),
            Error::Authentication(_)
        ));
    }

    #[test]
    fn test_client_misconfiguration_is_config() {
        let err = token_error("Refresh", refused(BasicErrorResponseType::InvalidClient));
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_token_endpoint_outage_is_transient() {
        let unavailable =
            BasicErrorResponseType::Extension("temporarily_unavailable".to_string());
        let err = token_error("Refresh", refused(unavailable));
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_transient());

        let empty: TokenRequestError =
            RequestTokenError::Other("server returned empty error response".to_string());
        let err = token_error("Refresh", empty);
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_token_manager_states() {
        let manager = TokenManager::with_refresh_token(
            AuthManager::new(test_config()).unwrap(),
            SecretString::default(),
        );
        assert_eq!(manager.state().await, AuthState::Unauthenticated);
        assert!(matches!(
            manager.get_access_token().await,
            Err(Error::Authentication(_))
        ));

        manager
            .update_tokens(Some(tokens_expiring_in(Duration::hours(1))))
            .await;
        assert_eq!(manager.state().await, AuthState::Valid);
        assert_eq!(manager.get_access_token().await.unwrap().expose(), "test");

        manager
            .update_tokens(Some(tokens_expiring_in(Duration::hours(-1))))
            .await;
        assert_eq!(manager.state().await, AuthState::Expired);
    }
}
