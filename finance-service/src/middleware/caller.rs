//! Caller identity for finance endpoints.
//!
//! The gateway in front of this service authenticates the user and forwards
//! the identity as `X-User-ID` and the user's roles as a comma-separated
//! `X-User-Roles` header. Operations receive it explicitly as a
//! [`CallerContext`]; nothing reads ambient request state.

use crate::config::parse_roles;
use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USER_ROLES_HEADER: &str = "X-User-Roles";

const GUEST: &str = "Guest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl CallerContext {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.user_id == GUEST
    }

    pub fn has_any_role(&self, allowed: &[String]) -> bool {
        self.roles.iter().any(|r| allowed.iter().any(|a| a == r))
    }

    /// Identity recorded on payment history rows.
    pub fn recorded_by(&self) -> Option<&str> {
        (!self.is_guest()).then_some(self.user_id.as_str())
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER).unwrap_or(GUEST).to_string();
        let roles = header(parts, USER_ROLES_HEADER).map(parse_roles).unwrap_or_default();

        tracing::Span::current().record("user_id", user_id.as_str());

        Ok(CallerContext::new(user_id, roles))
    }
}

/// A caller holding at least one configured finance admin role. Rejects
/// everyone else before the handler touches any data.
#[derive(Debug, Clone)]
pub struct AdminCaller(pub CallerContext);

#[async_trait]
impl FromRequestParts<AppState> for AdminCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let caller = CallerContext::from_request_parts(parts, state).await?;
        if caller.is_guest() || !caller.has_any_role(&state.config.finance.admin_roles) {
            tracing::warn!(user_id = %caller.user_id, path = %parts.uri.path(), "Finance access denied");
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "You do not have permission to access finance data"
            )));
        }
        Ok(AdminCaller(caller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn caller(builder: axum::http::request::Builder) -> CallerContext {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CallerContext::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn reads_identity_headers() {
        let c = caller(
            Request::builder()
                .header(USER_ID_HEADER, "accountant@school.edu")
                .header(USER_ROLES_HEADER, "Registrar, Librarian"),
        )
        .await;
        assert_eq!(c.user_id, "accountant@school.edu");
        assert_eq!(c.roles, vec!["Registrar".to_string(), "Librarian".to_string()]);
        assert_eq!(c.recorded_by(), Some("accountant@school.edu"));
    }

    #[tokio::test]
    async fn missing_headers_mean_guest() {
        let c = caller(Request::builder()).await;
        assert!(c.is_guest());
        assert!(c.roles.is_empty());
        assert_eq!(c.recorded_by(), None);
    }

    #[test]
    fn role_matching_is_exact() {
        let allowed = vec!["SIS Manager".to_string()];
        assert!(CallerContext::new("u", vec!["SIS Manager".into()]).has_any_role(&allowed));
        assert!(!CallerContext::new("u", vec!["sis manager".into()]).has_any_role(&allowed));
    }
}
