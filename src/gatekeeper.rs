//! Edge gatekeeper for the admin pages.
//!
//! Runs in front of every route. Requests under `/admin` need a valid
//! session token; some sub-prefixes additionally need a capability from the
//! permission table. The token is decoded directly, without touching the
//! store, so the gate keeps working while the database is unavailable.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::Request,
    response::{IntoResponse, Redirect, Response},
};
use tower::{Layer, Service};

use crate::rbac::{Permission, Role};
use crate::session::{session_token, TokenSigner};

/// Prefix of every gated page.
pub const ADMIN_PREFIX: &str = "/admin";

/// Where unauthenticated visitors are sent.
pub const LOGIN_PATH: &str = "/login";

/// A sub-prefix of the admin area that needs a capability.
#[derive(Debug, Clone, Copy)]
pub struct GateRule {
    pub prefix: &'static str,
    pub permission: Permission,
    pub redirect: &'static str,
}

/// Capability rules, most specific first.
pub const GATE_RULES: &[GateRule] = &[
    GateRule {
        prefix: "/admin/users",
        permission: Permission::ViewUsers,
        redirect: ADMIN_PREFIX,
    },
    GateRule {
        prefix: "/admin/content",
        permission: Permission::AccessContent,
        redirect: "/",
    },
];

/// Outcome of the gate for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Forward,
    Redirect(String),
}

/// Whether `path` is `prefix` or lies beneath it.
///
/// `/administrator` is not under `/admin`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Path as the gate sees it: percent-escapes decoded, empty and `.`
/// segments dropped.
///
/// `/admin//users/x` and `/admin/./users` gate like `/admin/users/x`.
pub fn canonical_path(path: &str) -> String {
    let decoded = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());
    let segments: Vec<&str> = decoded
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Login redirect carrying the original location as `callbackUrl`.
pub fn login_redirect(path: &str, query: Option<&str>) -> String {
    let target = match query {
        Some(query) if !query.is_empty() => format!("{}?{}", path, query),
        _ => path.to_string(),
    };
    format!("{}?callbackUrl={}", LOGIN_PATH, urlencoding::encode(&target))
}

/// Decide what to do with a request.
///
/// `role` is `None` when no valid token was presented.
pub fn evaluate(path: &str, query: Option<&str>, role: Option<Role>) -> GateDecision {
    let path = canonical_path(path);
    if !path_has_prefix(&path, ADMIN_PREFIX) {
        return GateDecision::Forward;
    }

    let Some(role) = role else {
        return GateDecision::Redirect(login_redirect(&path, query));
    };

    GATE_RULES
        .iter()
        .find(|rule| path_has_prefix(&path, rule.prefix))
        .filter(|rule| !role.has_permission(rule.permission))
        .map(|rule| GateDecision::Redirect(rule.redirect.to_string()))
        .unwrap_or(GateDecision::Forward)
}

/// Layer installing the gatekeeper.
#[derive(Clone)]
pub struct GatekeeperLayer {
    signer: Arc<TokenSigner>,
}

impl GatekeeperLayer {
    pub fn new(signer: Arc<TokenSigner>) -> Self {
        Self { signer }
    }
}

impl<S> Layer<S> for GatekeeperLayer {
    type Service = GatekeeperService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GatekeeperService {
            inner,
            signer: self.signer.clone(),
        }
    }
}

/// Service that redirects gated requests and forwards the rest.
#[derive(Clone)]
pub struct GatekeeperService<S> {
    inner: S,
    signer: Arc<TokenSigner>,
}

impl<S> Service<Request> for GatekeeperService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let path = req.uri().path();

        let decision = if path_has_prefix(&canonical_path(path), ADMIN_PREFIX) {
            let role = session_token(req.headers())
                .and_then(|token| self.signer.decode(&token))
                .map(|claims| claims.role());
            evaluate(path, req.uri().query(), role)
        } else {
            GateDecision::Forward
        };

        match decision {
            GateDecision::Forward => {
                let mut inner = self.inner.clone();
                Box::pin(async move { inner.call(req).await })
            }
            GateDecision::Redirect(location) => {
                tracing::debug!(path = %req.uri().path(), location = %location, "Gatekeeper redirect");
                Box::pin(async move { Ok(Redirect::temporary(&location).into_response()) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, StatusCode},
        routing::get,
        Router,
    };
    use chrono::Duration;
    use tower::ServiceExt;

    use super::*;
    use crate::session::{TokenSubject, SESSION_COOKIE};

    const SECRET: &str = "test-secret-that-is-at-least-32-bytes-long";

    fn signer() -> Arc<TokenSigner> {
        Arc::new(TokenSigner::new(SECRET, Duration::hours(1)))
    }

    fn token_for(signer: &TokenSigner, role: Role) -> String {
        signer
            .issue(&TokenSubject {
                id: "u1",
                email: "u1@example.org",
                name: "U One",
                role,
                avatar: None,
            })
            .unwrap()
            .0
    }

    fn app(signer: Arc<TokenSigner>) -> Router {
        Router::new()
            .route("/", get(|| async { "home" }))
            .fallback(|| async { "page" })
            .layer(GatekeeperLayer::new(signer))
    }

    async fn send(app: Router, uri: &str, token: Option<&str>) -> Response {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::COOKIE, format!("{}={}", SESSION_COOKIE, token));
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    #[test]
    fn prefix_matching_is_segment_aware() {
        assert!(path_has_prefix("/admin", "/admin"));
        assert!(path_has_prefix("/admin/", "/admin"));
        assert!(path_has_prefix("/admin/users/42", "/admin/users"));
        assert!(!path_has_prefix("/administrator", "/admin"));
        assert!(!path_has_prefix("/admin/usersettings", "/admin/users"));
        assert!(!path_has_prefix("/", "/admin"));
    }

    #[test]
    fn canonical_path_collapses_odd_spellings() {
        assert_eq!(canonical_path("/admin//users/x"), "/admin/users/x");
        assert_eq!(canonical_path("//admin/./users/"), "/admin/users");
        assert_eq!(canonical_path("/admin/%75sers"), "/admin/users");
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path(""), "/");
    }

    #[test]
    fn odd_spellings_of_users_pages_are_still_gated() {
        for path in ["/admin//users/x", "//admin/users", "/admin/./users", "/admin/%75sers/1"] {
            assert_eq!(
                evaluate(path, None, Some(Role::ContentManager)),
                GateDecision::Redirect("/admin".to_string()),
                "{}",
                path
            );
        }
        assert_eq!(
            evaluate("/admin//users", None, None),
            GateDecision::Redirect("/login?callbackUrl=%2Fadmin%2Fusers".to_string())
        );
    }

    #[test]
    fn anonymous_admin_request_goes_to_login() {
        assert_eq!(
            evaluate("/admin/events", Some("page=2"), None),
            GateDecision::Redirect("/login?callbackUrl=%2Fadmin%2Fevents%3Fpage%3D2".to_string())
        );
        assert_eq!(
            evaluate("/admin", None, None),
            GateDecision::Redirect("/login?callbackUrl=%2Fadmin".to_string())
        );
    }

    #[test]
    fn public_paths_are_forwarded() {
        assert_eq!(evaluate("/", None, None), GateDecision::Forward);
        assert_eq!(evaluate("/events", None, None), GateDecision::Forward);
        assert_eq!(evaluate("/administrator", None, None), GateDecision::Forward);
        assert_eq!(evaluate("/api/admin/stats", None, None), GateDecision::Forward);
    }

    #[test]
    fn users_pages_are_admin_only() {
        for role in [Role::ContentManager, Role::ContentReviewer, Role::Member] {
            assert_eq!(
                evaluate("/admin/users/7", None, Some(role)),
                GateDecision::Redirect("/admin".to_string()),
                "{}",
                role
            );
        }
        assert_eq!(
            evaluate("/admin/users", None, Some(Role::Admin)),
            GateDecision::Forward
        );
    }

    #[test]
    fn content_pages_need_content_access() {
        assert_eq!(
            evaluate("/admin/content", None, Some(Role::Member)),
            GateDecision::Redirect("/".to_string())
        );
        for role in [Role::Admin, Role::ContentManager, Role::ContentReviewer] {
            assert_eq!(
                evaluate("/admin/content/drafts", None, Some(role)),
                GateDecision::Forward
            );
        }
    }

    #[test]
    fn admin_landing_needs_only_a_session() {
        assert_eq!(
            evaluate("/admin", None, Some(Role::Member)),
            GateDecision::Forward
        );
    }

    /// Capabilities the handlers behind each gated prefix declare.
    const HANDLER_CAPABILITIES: &[(&str, &[Permission])] = &[
        (
            "/admin/users",
            &[Permission::ViewUsers, Permission::ManageUsers],
        ),
        (
            "/admin/content",
            &[
                Permission::AccessContent,
                Permission::CreateContent,
                Permission::ReviewContent,
            ],
        ),
    ];

    #[test]
    fn gate_admits_every_role_a_handler_admits() {
        for (prefix, capabilities) in HANDLER_CAPABILITIES {
            let path = format!("{}/x", prefix);
            for role in Role::ALL {
                let handler_allows = capabilities.iter().any(|c| role.has_permission(*c));
                if handler_allows {
                    assert_eq!(
                        evaluate(&path, None, Some(role)),
                        GateDecision::Forward,
                        "{} blocked at the gate for {}",
                        role,
                        prefix
                    );
                }
            }
        }
    }

    #[test]
    fn every_rule_has_handler_capabilities() {
        for rule in GATE_RULES {
            assert!(
                HANDLER_CAPABILITIES
                    .iter()
                    .any(|(prefix, _)| *prefix == rule.prefix),
                "{}",
                rule.prefix
            );
        }
    }

    #[tokio::test]
    async fn layer_redirects_without_token() {
        let response = send(app(signer()), "/admin/users", None).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/login?callbackUrl=%2Fadmin%2Fusers");
    }

    #[tokio::test]
    async fn layer_redirects_with_forged_token() {
        let other = TokenSigner::new("some-other-secret-with-enough-bytes!!", Duration::hours(1));
        let token = token_for(&other, Role::Admin);

        let response = send(app(signer()), "/admin", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert!(location(&response).starts_with("/login?callbackUrl="));
    }

    #[tokio::test]
    async fn layer_redirects_non_admin_from_users() {
        let signer = signer();
        let token = token_for(&signer, Role::ContentManager);

        let response = send(app(signer), "/admin/users/3", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/admin");
    }

    #[tokio::test]
    async fn layer_gates_doubled_slashes() {
        let signer = signer();
        let token = token_for(&signer, Role::ContentManager);

        let response = send(app(signer.clone()), "/admin//users/x", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/admin");

        let response = send(app(signer), "/admin//users", None).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/login?callbackUrl=%2Fadmin%2Fusers");
    }

    #[tokio::test]
    async fn layer_forwards_authorized_requests() {
        let signer = signer();
        let token = token_for(&signer, Role::ContentReviewer);

        let response = send(app(signer.clone()), "/admin/content", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(app(signer), "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
