//! Role-based access control.
//!
//! The permission table is static: each [`Role`] maps to a fixed slice of
//! [`Permission`]s. Both the edge gatekeeper and every admin handler
//! consult it, the handlers through the [`Authorized`] extractor whose type
//! parameter names the capability at compile time.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorContext, Result, SiteError};
use crate::session::{Session, SessionResolver};

// ========== Roles ==========

/// Coarse-grained label attached to every account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    ContentManager,
    ContentReviewer,
    /// Authenticated, no elevated role.
    Member,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Admin,
        Role::ContentManager,
        Role::ContentReviewer,
        Role::Member,
    ];

    /// Convert from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "content_manager" => Some(Role::ContentManager),
            "content_reviewer" => Some(Role::ContentReviewer),
            "member" => Some(Role::Member),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::ContentManager => "content_manager",
            Role::ContentReviewer => "content_reviewer",
            Role::Member => "member",
        }
    }

    /// The capabilities granted to this role.
    pub fn permissions(&self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Admin => &[
                ViewStats,
                ViewSubscribers,
                DeleteSubscriber,
                ViewMessages,
                ManageMessages,
                ManageEvents,
                ManageResources,
                AccessContent,
                CreateContent,
                ReviewContent,
                ManageApplications,
                ViewUsers,
                ManageUsers,
                ViewAudit,
            ],
            Role::ContentManager => &[
                ViewStats,
                ViewSubscribers,
                ManageEvents,
                ManageResources,
                AccessContent,
                CreateContent,
            ],
            Role::ContentReviewer => &[AccessContent, ReviewContent],
            Role::Member => &[],
        }
    }

    /// Check if this role has a specific permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========== Permissions ==========

/// All named capabilities in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    ViewStats,
    ViewSubscribers,
    DeleteSubscriber,
    ViewMessages,
    ManageMessages,
    ManageEvents,
    ManageResources,
    AccessContent,
    CreateContent,
    ReviewContent,
    ManageApplications,
    ViewUsers,
    ManageUsers,
    ViewAudit,
}

impl Permission {
    pub const ALL: [Permission; 14] = [
        Permission::ViewStats,
        Permission::ViewSubscribers,
        Permission::DeleteSubscriber,
        Permission::ViewMessages,
        Permission::ManageMessages,
        Permission::ManageEvents,
        Permission::ManageResources,
        Permission::AccessContent,
        Permission::CreateContent,
        Permission::ReviewContent,
        Permission::ManageApplications,
        Permission::ViewUsers,
        Permission::ManageUsers,
        Permission::ViewAudit,
    ];

    /// Capability identifier as used by clients and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ViewStats => "view:stats",
            Permission::ViewSubscribers => "view:subscribers",
            Permission::DeleteSubscriber => "delete:subscriber",
            Permission::ViewMessages => "view:messages",
            Permission::ManageMessages => "manage:messages",
            Permission::ManageEvents => "manage:events",
            Permission::ManageResources => "manage:resources",
            Permission::AccessContent => "access:content",
            Permission::CreateContent => "create:content",
            Permission::ReviewContent => "review:content",
            Permission::ManageApplications => "manage:applications",
            Permission::ViewUsers => "view:users",
            Permission::ManageUsers => "manage:users",
            Permission::ViewAudit => "view:audit",
        }
    }

    /// Parse a capability identifier.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// Capability every holder of `self` must also hold.
    ///
    /// The gatekeeper guards page prefixes with the prerequisite, so any
    /// role a handler admits is also admitted at the edge.
    pub fn prerequisite(&self) -> Option<Permission> {
        match self {
            Permission::CreateContent | Permission::ReviewContent => {
                Some(Permission::AccessContent)
            }
            Permission::ManageUsers => Some(Permission::ViewUsers),
            Permission::DeleteSubscriber => Some(Permission::ViewSubscribers),
            Permission::ManageMessages => Some(Permission::ViewMessages),
            _ => None,
        }
    }

    /// Status returned when an authenticated caller lacks this capability.
    ///
    /// Event management answers 401 because the admin console treats that
    /// status as "sign in with a different account".
    pub fn denial_status(&self) -> StatusCode {
        match self {
            Permission::ManageEvents => StatusCode::UNAUTHORIZED,
            _ => StatusCode::FORBIDDEN,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a capability by its string identifiers.
///
/// Unknown roles and unknown capabilities are never granted.
pub fn has_permission(role: &str, capability: &str) -> bool {
    match (Role::parse(role), Permission::parse(capability)) {
        (Some(role), Some(permission)) => role.has_permission(permission),
        _ => false,
    }
}

/// Resolve the session and require `permission` for its role.
///
/// Fails with [`SiteError::Unauthenticated`] when there is no session and
/// [`SiteError::Forbidden`] when the role lacks the capability.
pub async fn require_permission(
    resolver: &SessionResolver,
    headers: &HeaderMap,
    permission: Permission,
) -> Result<Session> {
    authorize(resolver.resolve(headers).await?, permission)
}

/// Check an already resolved session against `permission`.
pub fn authorize(session: Option<Session>, permission: Permission) -> Result<Session> {
    let session = session.ok_or(SiteError::Unauthenticated)?;

    if !session.role.has_permission(permission) {
        return Err(SiteError::Forbidden {
            capability: permission.as_str(),
            status: permission.denial_status(),
        });
    }

    Ok(session)
}

// ========== Axum Integration ==========

/// Marker for a capability checked at extraction time.
pub trait Capability: Send + Sync + 'static {
    const PERMISSION: Permission;
}

macro_rules! capabilities {
    ($($marker:ident => $permission:ident),* $(,)?) => {
        $(
            #[doc = concat!("Requires `", stringify!($permission), "`.")]
            pub struct $marker;

            impl Capability for $marker {
                const PERMISSION: Permission = Permission::$permission;
            }
        )*
    };
}

capabilities! {
    CanViewStats => ViewStats,
    CanViewSubscribers => ViewSubscribers,
    CanDeleteSubscriber => DeleteSubscriber,
    CanViewMessages => ViewMessages,
    CanManageMessages => ManageMessages,
    CanManageEvents => ManageEvents,
    CanManageResources => ManageResources,
    CanAccessContent => AccessContent,
    CanCreateContent => CreateContent,
    CanReviewContent => ReviewContent,
    CanManageApplications => ManageApplications,
    CanViewUsers => ViewUsers,
    CanManageUsers => ManageUsers,
    CanViewAudit => ViewAudit,
}

/// Session that has been checked for capability `C`.
///
/// Handlers that take an `Authorized<C>` argument cannot run without the
/// check having passed.
pub struct Authorized<C: Capability> {
    pub session: Session,
    _capability: PhantomData<C>,
}

impl<C: Capability> Authorized<C> {
    fn new(session: Session) -> Self {
        Self {
            session,
            _capability: PhantomData,
        }
    }

    /// Error context pre-filled with the caller.
    pub fn context(&self, operation: &str) -> ErrorContext {
        ErrorContext::new(operation).with_user_id(self.session.id.clone())
    }
}

impl<S, C> FromRequestParts<S> for Authorized<C>
where
    S: Send + Sync,
    C: Capability,
    Arc<SessionResolver>: FromRef<S>,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let resolver = <Arc<SessionResolver> as FromRef<S>>::from_ref(state);
        let permission = C::PERMISSION;
        let context = ErrorContext::new(format!("authorize {}", permission));

        let session = match resolver.resolve(&parts.headers).await {
            Ok(session) => session,
            Err(err) => return Err(crate::web::handle_error(err, context).into_response()),
        };

        if let Some(session) = &session {
            if !session.role.has_permission(permission) {
                record_denial(&resolver, session, permission, parts.uri.path()).await;
            }
        }

        authorize(session, permission)
            .map(Self::new)
            .map_err(|err| crate::web::handle_error(err, context).into_response())
    }
}

/// Log a permission denial and write it to the audit log.
async fn record_denial(
    resolver: &SessionResolver,
    session: &Session,
    permission: Permission,
    path: &str,
) {
    tracing::warn!(
        user_id = %session.id,
        role = %session.role,
        required = %permission,
        path = %path,
        "Permission denied"
    );

    let details = format!(
        "Role {} lacks {} for {}",
        session.role.as_str(),
        permission.as_str(),
        path
    );
    let written = match resolver.store().connection().await {
        Ok(db) => {
            db.create_audit_log(&session.id, "permission_denied", Some(&details))
                .await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        tracing::warn!(
            user_id = %session.id,
            error = %e,
            "Failed to record permission denial"
        );
    }
}
