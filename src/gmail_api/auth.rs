//! Credential lifecycle for one Gmail account: stored token files,
//! refresh against the token endpoint, and the installed-app consent
//! flow with a loopback redirect listener.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, RedirectUrl,
    RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};

/// OAuth scopes requested for both accounts. If this set changes, the
/// stored token files must be deleted so consent runs again.
pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.modify"];

// Refresh slightly early so an in-flight request cannot race the expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) >= expiry,
            None => false,
        }
    }
}

/// Fresh tokens as returned by the authorization server.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

/// OAuth client registration, read from a Google client secrets file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientConfig>,
    web: Option<ClientConfig>,
}

pub fn read_client_secrets(path: &Path) -> Result<ClientConfig> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::Auth(format!("cannot read client secrets {}: {e}", path.display())))?;
    let file: ClientSecretsFile = serde_json::from_str(&data)
        .map_err(|e| Error::Auth(format!("malformed client secrets {}: {e}", path.display())))?;
    file.installed
        .or(file.web)
        .ok_or_else(|| Error::Auth(format!("{} has no installed or web section", path.display())))
}

// Define a trait for token storage to allow mocking
#[cfg_attr(test, mockall::automock)]
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
}

/// One JSON file per account nickname: `token.{nickname}.json`.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn for_account(dir: &Path, nickname: &str) -> Self {
        FileTokenStore {
            path: dir.join(format!("token.{nickname}.json")),
        }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<Credential>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                // Treat a broken token file as absent so consent runs again.
                warn!("ignoring malformed token file {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let data = serde_json::to_string_pretty(credential)
            .map_err(|e| Error::Internal(format!("credential serialization: {e}")))?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

// Define a trait for OAuth flow operations to allow mocking
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthFlow: Send + Sync {
    async fn refresh(&self, config: &ClientConfig, refresh_token: &str) -> Result<TokenSet>;
    async fn consent(&self, config: &ClientConfig, scopes: Vec<String>) -> Result<TokenSet>;
}

/// Production flow against the Google OAuth endpoints.
pub struct GoogleAuthFlow;

impl GoogleAuthFlow {
    fn oauth_client(config: &ClientConfig, redirect: Option<RedirectUrl>) -> Result<BasicClient> {
        let auth_url = AuthUrl::new(config.auth_uri.clone())
            .map_err(|e| Error::Auth(format!("invalid auth_uri: {e}")))?;
        let token_url = TokenUrl::new(config.token_uri.clone())
            .map_err(|e| Error::Auth(format!("invalid token_uri: {e}")))?;
        let mut client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            auth_url,
            Some(token_url),
        );
        if let Some(redirect) = redirect {
            client = client.set_redirect_uri(redirect);
        }
        Ok(client)
    }
}

fn token_set_from_response(response: &BasicTokenResponse) -> TokenSet {
    let expiry = response
        .expires_in()
        .map(|d| Utc::now() + Duration::seconds(d.as_secs() as i64));
    TokenSet {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expiry,
    }
}

#[async_trait]
impl AuthFlow for GoogleAuthFlow {
    async fn refresh(&self, config: &ClientConfig, refresh_token: &str) -> Result<TokenSet> {
        let client = Self::oauth_client(config, None)?;
        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::Auth(format!("token refresh rejected: {e}")))?;
        debug!("access token refreshed");
        let mut tokens = token_set_from_response(&response);
        // Google omits the refresh token on refresh responses.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        Ok(tokens)
    }

    async fn consent(&self, config: &ClientConfig, scopes: Vec<String>) -> Result<TokenSet> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Auth(format!("cannot bind redirect listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Auth(format!("redirect listener address: {e}")))?
            .port();
        let redirect = RedirectUrl::new(format!("http://127.0.0.1:{port}"))
            .map_err(|e| Error::Auth(format!("invalid redirect url: {e}")))?;
        let client = Self::oauth_client(config, Some(redirect))?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(pkce_challenge);
        for scope in scopes {
            request = request.add_scope(Scope::new(scope));
        }
        let (authorize_url, csrf_state) = request.url();

        println!("Open this URL in your browser to authorize the account:");
        println!("{authorize_url}");

        let (code, state) = wait_for_redirect(&listener).await?;
        if state != *csrf_state.secret() {
            return Err(Error::Auth("state mismatch in OAuth callback".to_string()));
        }

        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::Auth(format!("code exchange failed: {e}")))?;
        info!("consent granted");
        let tokens = token_set_from_response(&response);
        if tokens.refresh_token.is_none() {
            warn!("authorization server granted no refresh token; the next run will need consent again");
        }
        Ok(tokens)
    }
}

async fn wait_for_redirect(listener: &TcpListener) -> Result<(String, String)> {
    let (mut stream, _) = listener
        .accept()
        .await
        .map_err(|e| Error::Auth(format!("redirect listener accept: {e}")))?;
    let mut request_line = String::new();
    {
        let mut reader = BufReader::new(&mut stream);
        reader
            .read_line(&mut request_line)
            .await
            .map_err(|e| Error::Auth(format!("reading redirect request: {e}")))?;
    }

    let result = parse_redirect_request(&request_line);
    let body = match &result {
        Ok(_) => "Authorization received. You can close this tab and return to the terminal.",
        Err(_) => "Authorization failed. You can close this tab and check the terminal.",
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!("could not respond to browser: {e}");
    }
    result
}

/// Extract the authorization code and CSRF state from the request line of
/// the loopback redirect, e.g. `GET /?state=..&code=.. HTTP/1.1`.
fn parse_redirect_request(request_line: &str) -> Result<(String, String)> {
    let path = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Auth(format!("malformed redirect request: {request_line:?}")))?;
    let url = Url::parse(&format!("http://127.0.0.1{path}"))
        .map_err(|e| Error::Auth(format!("unparseable redirect path {path:?}: {e}")))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(Error::Auth(format!("consent denied: {value}"))),
            _ => {}
        }
    }
    match (code, state) {
        (Some(code), Some(state)) => Ok((code, state)),
        _ => Err(Error::Auth("redirect missing code or state".to_string())),
    }
}

/// Decides how a usable credential is produced for one account: stored
/// as-is, refreshed, or through interactive consent. Whatever refresh or
/// consent returns is persisted before it is handed back.
pub struct CredentialManager {
    nickname: String,
    config: ClientConfig,
    store: Box<dyn TokenStore>,
    flow: Box<dyn AuthFlow>,
}

impl CredentialManager {
    pub fn new(
        nickname: impl Into<String>,
        config: ClientConfig,
        store: Box<dyn TokenStore>,
        flow: Box<dyn AuthFlow>,
    ) -> Self {
        CredentialManager {
            nickname: nickname.into(),
            config,
            store,
            flow,
        }
    }

    /// File-backed manager for `token.{nickname}.json` under `token_dir`.
    pub fn for_account(config: ClientConfig, token_dir: &Path, nickname: &str) -> Self {
        Self::new(
            nickname,
            config,
            Box::new(FileTokenStore::for_account(token_dir, nickname)),
            Box::new(GoogleAuthFlow),
        )
    }

    pub async fn obtain(&self) -> Result<Credential> {
        if let Some(stored) = self.store.load()? {
            if !stored.is_expired() {
                debug!("stored credential for {} is still valid", self.nickname);
                return Ok(stored);
            }
            if let Some(refresh_token) = stored.refresh_token.clone() {
                match self.refresh(&stored, &refresh_token).await {
                    Ok(refreshed) => return Ok(refreshed),
                    Err(e) => warn!(
                        "refresh for {} failed ({e}); starting interactive consent",
                        self.nickname
                    ),
                }
            }
        }
        info!("requesting interactive consent for account {:?}", self.nickname);
        let tokens = self.flow.consent(&self.config, scopes_owned()).await?;
        let credential = Credential {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expiry: tokens.expiry,
            scopes: scopes_owned(),
        };
        self.store.save(&credential)?;
        Ok(credential)
    }

    /// Refresh with no consent fallback, persisting the result.
    async fn refresh(&self, current: &Credential, refresh_token: &str) -> Result<Credential> {
        let tokens = self.flow.refresh(&self.config, refresh_token).await?;
        let credential = Credential {
            access_token: tokens.access_token,
            // A refresh response may omit the refresh token; keep the one we had.
            refresh_token: tokens.refresh_token.or_else(|| Some(refresh_token.to_string())),
            expiry: tokens.expiry,
            scopes: current.scopes.clone(),
        };
        self.store.save(&credential)?;
        debug!("refreshed credential for {} persisted", self.nickname);
        Ok(credential)
    }
}

fn scopes_owned() -> Vec<String> {
    SCOPES.iter().map(|s| s.to_string()).collect()
}

/// Per-request token source for a client. Hands out the current access
/// token, refreshing and persisting first once it has expired, so a run
/// longer than a token lifetime keeps going. Consent is never started
/// here; a mid-run refresh failure is fatal.
pub struct Authenticator {
    manager: CredentialManager,
    current: Mutex<Credential>,
}

impl Authenticator {
    /// Run the startup ladder (stored / refresh / consent) and keep the
    /// resulting credential for per-request use.
    pub async fn login(manager: CredentialManager) -> Result<Self> {
        let credential = manager.obtain().await?;
        Ok(Authenticator {
            manager,
            current: Mutex::new(credential),
        })
    }

    pub async fn access_token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if current.is_expired() {
            let refresh_token = current.refresh_token.clone().ok_or_else(|| {
                Error::Auth("access token expired and no refresh token is stored".to_string())
            })?;
            info!("access token expired mid-run; refreshing");
            *current = self.manager.refresh(&current, &refresh_token).await?;
        }
        Ok(current.access_token.clone())
    }
}
