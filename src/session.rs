//! Session tokens and per-request session resolution.
//!
//! A session is never stored. It is decoded from a signed token carried in
//! the `sangha_session` cookie (or a bearer header) on every request.

use std::sync::Arc;

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::database::DataStore;
use crate::error::{Result, SiteError};
use crate::rbac::Role;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "sangha_session";

/// Seconds of clock skew tolerated when checking expiry.
const EXPIRY_LEEWAY_SECS: u64 = 5;

/// Claims encoded in a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// Role claim, with unrecognised values treated as the default role.
    pub fn role(&self) -> Role {
        Role::parse(&self.role).unwrap_or(Role::Member)
    }
}

/// Identity to put into a freshly issued token.
#[derive(Debug, Clone)]
pub struct TokenSubject<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub name: &'a str,
    pub role: Role,
    pub avatar: Option<&'a str>,
}

/// Issues and verifies HS256 session tokens.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenSigner {
    /// Create a signer for `secret` issuing tokens valid for `ttl`.
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = EXPIRY_LEEWAY_SECS;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    /// Token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `subject`. Returns the token and its expiry.
    pub fn issue(&self, subject: &TokenSubject<'_>) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires = now + self.ttl;
        let claims = Claims {
            sub: subject.id.to_string(),
            email: subject.email.to_string(),
            name: subject.name.to_string(),
            role: subject.role.as_str().to_string(),
            avatar: subject.avatar.map(str::to_string),
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };

        self.sign(&claims).map(|token| (token, expires))
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| SiteError::Session(format!("Failed to sign token: {}", e)))
    }

    /// Verify a token. Malformed, forged or expired tokens yield `None`.
    pub fn decode(&self, token: &str) -> Option<Claims> {
        match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "Rejected session token");
                None
            }
        }
    }
}

/// Decoded identity and role claims of an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub expires: DateTime<Utc>,
}

impl Session {
    /// Build a session from verified claims.
    pub fn from_claims(claims: Claims) -> Result<Self> {
        let role = claims.role();
        let expires = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| SiteError::Session(format!("Invalid expiry {}", claims.exp)))?;

        Ok(Self {
            id: claims.sub,
            email: claims.email,
            name: claims.name,
            role,
            avatar: claims.avatar,
            expires,
        })
    }
}

/// Extract the session token from the cookie header, falling back to a
/// bearer `Authorization` header.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|cookie| {
            let mut parts = cookie.trim().splitn(2, '=');
            let name = parts.next()?;
            let value = parts.next()?;
            if name == SESSION_COOKIE && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        });

    from_cookie.or_else(|| {
        headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

/// Resolves the session for a request.
pub struct SessionResolver {
    store: Arc<DataStore>,
    signer: Arc<TokenSigner>,
}

impl SessionResolver {
    /// Create a new session resolver.
    pub fn new(store: Arc<DataStore>, signer: Arc<TokenSigner>) -> Self {
        Self { store, signer }
    }

    /// The store handle sessions are checked against.
    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// The signer tokens are verified with.
    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Resolve the current session.
    ///
    /// Returns `Ok(None)` only when no valid token is present, including
    /// tokens for accounts that no longer exist. Store failures surface as
    /// `DatabaseInitializing`/`Database`; anything else as `Session`.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Option<Session>> {
        let Some(token) = session_token(headers) else {
            return Ok(None);
        };
        let Some(claims) = self.signer.decode(&token) else {
            return Ok(None);
        };

        self.check_account(claims).await.map_err(|err| match err {
            SiteError::DatabaseInitializing | SiteError::Database(_) | SiteError::Session(_) => {
                err
            }
            other => SiteError::Session(other.to_string()),
        })
    }

    async fn check_account(&self, claims: Claims) -> Result<Option<Session>> {
        let db = self.store.connection().await?;
        if !crate::users::account_exists(db, &claims.sub).await? {
            tracing::debug!(user_id = %claims.sub, "Token for unknown account");
            return Ok(None);
        }
        Session::from_claims(claims).map(Some)
    }

    /// ID of the current user, if any.
    pub async fn user_id(&self, headers: &HeaderMap) -> Result<Option<String>> {
        Ok(self.resolve(headers).await?.map(|session| session.id))
    }

    /// Role of the current user, if any.
    pub async fn user_role(&self, headers: &HeaderMap) -> Result<Option<Role>> {
        Ok(self.resolve(headers).await?.map(|session| session.role))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::database::Database;
    use crate::rbac::{require_permission, Permission};
    use crate::users::{NewUser, UserDirectory};

    const SECRET: &str = "test-secret-that-is-at-least-32-bytes-long";

    fn signer() -> Arc<TokenSigner> {
        Arc::new(TokenSigner::new(SECRET, Duration::hours(1)))
    }

    fn cookie_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {}={}", SESSION_COOKIE, token)).unwrap(),
        );
        headers
    }

    async fn resolver_with_user(role: Role) -> (SessionResolver, String) {
        let store = Arc::new(DataStore::ready(Database::in_memory().await.unwrap()));
        let users = UserDirectory::new(store.clone());
        let user = users
            .create(NewUser {
                email: "ana@example.org",
                name: "Ana",
                password: "correct horse battery",
                role,
            })
            .await
            .unwrap();

        let signer = signer();
        let (token, _) = signer
            .issue(&TokenSubject {
                id: &user.id,
                email: &user.email,
                name: &user.name,
                role: user.role,
                avatar: None,
            })
            .unwrap();

        (SessionResolver::new(store, signer), token)
    }

    #[test]
    fn session_token_parses_cookie() {
        let headers = cookie_headers("abc123");
        assert_eq!(session_token(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn session_token_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(session_token(&headers), Some("tok-1".to_string()));
    }

    #[test]
    fn session_token_ignores_similar_cookie_names() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("sangha_session_old=zzz"),
        );
        assert!(session_token(&headers).is_none());
    }

    #[test]
    fn session_token_returns_none_without_headers() {
        assert!(session_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn issued_tokens_decode() {
        let signer = signer();
        let (token, expires) = signer
            .issue(&TokenSubject {
                id: "u1",
                email: "u1@example.org",
                name: "U One",
                role: Role::ContentReviewer,
                avatar: Some("/avatars/u1.png"),
            })
            .unwrap();

        let claims = signer.decode(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role(), Role::ContentReviewer);
        assert_eq!(claims.exp, expires.timestamp());

        let session = Session::from_claims(claims).unwrap();
        assert_eq!(session.avatar.as_deref(), Some("/avatars/u1.png"));
    }

    #[test]
    fn forged_tokens_are_rejected() {
        let other = TokenSigner::new("another-secret-that-is-32-bytes-long!!", Duration::hours(1));
        let (token, _) = other
            .issue(&TokenSubject {
                id: "u1",
                email: "u1@example.org",
                name: "U One",
                role: Role::Admin,
                avatar: None,
            })
            .unwrap();

        assert!(signer().decode(&token).is_none());
        assert!(signer().decode("not-a-jwt").is_none());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = signer();
        let past = Utc::now() - Duration::hours(2);
        let token = signer
            .sign(&Claims {
                sub: "u1".to_string(),
                email: "u1@example.org".to_string(),
                name: "U One".to_string(),
                role: "admin".to_string(),
                avatar: None,
                iat: past.timestamp(),
                exp: (past + Duration::minutes(30)).timestamp(),
            })
            .unwrap();

        assert!(signer.decode(&token).is_none());
    }

    #[test]
    fn unknown_role_claim_has_no_privileges() {
        let claims = Claims {
            sub: "u1".to_string(),
            email: "u1@example.org".to_string(),
            name: "U".to_string(),
            role: "superuser".to_string(),
            avatar: None,
            iat: 0,
            exp: 0,
        };
        assert_eq!(claims.role(), Role::Member);
        assert!(claims.role().permissions().is_empty());
    }

    #[tokio::test]
    async fn resolve_returns_session_for_valid_token() {
        let (resolver, token) = resolver_with_user(Role::ContentManager).await;
        let headers = cookie_headers(&token);

        let session = resolver.resolve(&headers).await.unwrap().unwrap();
        assert_eq!(session.email, "ana@example.org");
        assert_eq!(session.role, Role::ContentManager);
        assert!(session.expires > Utc::now());

        assert_eq!(
            resolver.user_role(&headers).await.unwrap(),
            Some(Role::ContentManager)
        );
        assert_eq!(resolver.user_id(&headers).await.unwrap(), Some(session.id));
    }

    #[tokio::test]
    async fn resolve_returns_none_without_token() {
        let (resolver, _) = resolver_with_user(Role::Admin).await;
        assert!(resolver.resolve(&HeaderMap::new()).await.unwrap().is_none());
        assert!(resolver.user_id(&HeaderMap::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_returns_none_for_deleted_account() {
        let store = Arc::new(DataStore::ready(Database::in_memory().await.unwrap()));
        let signer = signer();
        let (token, _) = signer
            .issue(&TokenSubject {
                id: "ghost",
                email: "ghost@example.org",
                name: "Ghost",
                role: Role::Admin,
                avatar: None,
            })
            .unwrap();
        let resolver = SessionResolver::new(store, signer);

        assert!(resolver
            .resolve(&cookie_headers(&token))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn resolve_reports_initializing_store() {
        let store = Arc::new(DataStore::new(":memory:"));
        store.set_connecting(true);
        let signer = signer();
        let (token, _) = signer
            .issue(&TokenSubject {
                id: "u1",
                email: "u1@example.org",
                name: "U",
                role: Role::Admin,
                avatar: None,
            })
            .unwrap();
        let resolver = SessionResolver::new(store, signer);

        let err = resolver
            .resolve(&cookie_headers(&token))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATABASE_INITIALIZING");
        assert_eq!(err.status().as_u16(), 503);

        let err = resolver.user_role(&cookie_headers(&token)).await.unwrap_err();
        assert_eq!(err.code(), "DATABASE_INITIALIZING");
    }

    #[tokio::test]
    async fn require_permission_checks_role() {
        let (resolver, token) = resolver_with_user(Role::ContentReviewer).await;
        let headers = cookie_headers(&token);

        let session = require_permission(&resolver, &headers, Permission::ReviewContent)
            .await
            .unwrap();
        assert_eq!(session.role, Role::ContentReviewer);

        let err = require_permission(&resolver, &headers, Permission::DeleteSubscriber)
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Forbidden { .. }));

        let err = require_permission(&resolver, &HeaderMap::new(), Permission::ViewStats)
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Unauthenticated));
    }
}
