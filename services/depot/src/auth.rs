//! Bearer token authentication
//!
//! Tokens are verified by an [`Authenticator`]; this module only decides
//! whether a verified principal may perform the requested operation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secret::Secret;

use crate::error::RegistryError;
use crate::routes::Route;

/// The identity behind a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Who the token was issued to.
    pub subject: String,

    /// Whether the principal may push.
    pub push: bool,
}

/// Verifies bearer tokens.
#[async_trait]
pub trait Authenticator: fmt::Debug + Send + Sync {
    /// The principal a token belongs to, or `None` for an invalid token.
    async fn authenticate(&self, token: &str) -> Option<Principal>;
}

#[derive(Debug)]
struct StaticToken {
    token: Secret,
    principal: Principal,
}

/// A fixed set of tokens, e.g. from the configuration file.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: Vec<StaticToken>,
}

impl StaticTokens {
    /// An empty token set, which rejects everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `subject`.
    pub fn with_token(
        mut self,
        subject: impl Into<String>,
        token: impl Into<Secret>,
        push: bool,
    ) -> Self {
        self.tokens.push(StaticToken {
            token: token.into(),
            principal: Principal {
                subject: subject.into(),
                push,
            },
        });
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, token: &str) -> Option<Principal> {
        self.tokens
            .iter()
            .find(|candidate| candidate.token.matches(token))
            .map(|candidate| candidate.principal.clone())
    }
}

/// Middleware state: who verifies tokens and how to challenge clients.
#[derive(Debug, Clone)]
pub(crate) struct AuthGate {
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) realm: String,
    pub(crate) service: String,
}

impl AuthGate {
    fn challenge(&self, repository: Option<&str>, push: bool) -> Response {
        let mut value = format!(r#"Bearer realm="{}",service="{}""#, self.realm, self.service);
        if let Some(repository) = repository {
            let action = if push { "push" } else { "pull" };
            value.push_str(&format!(r#",scope="repository:{repository}:{action}""#));
        }

        let mut response = RegistryError::Unauthorized.into_response();
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
            Err(error) => tracing::warn!(%error, "unable to encode authentication challenge"),
        }
        response
    }
}

fn is_write(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Require a valid bearer token, and push rights for writes.
pub(crate) async fn authenticate(
    State(gate): State<AuthGate>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .uri()
        .path()
        .strip_prefix("/v2/")
        .and_then(Route::parse);
    let repository = route.as_ref().map(Route::repository);
    let write = is_write(request.method());

    let principal = match bearer_token(&request) {
        Some(token) => gate.authenticator.authenticate(token).await,
        None => None,
    };

    let Some(principal) = principal else {
        tracing::debug!(?repository, "rejecting unauthenticated request");
        return gate.challenge(repository, write);
    };

    if write && !principal.push {
        tracing::debug!(subject = %principal.subject, ?repository, "principal may not push");
        return RegistryError::Denied.into_response();
    }

    let mut request = request;
    request.extensions_mut().insert(principal);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_tokens_resolve_principals() {
        let tokens = StaticTokens::new()
            .with_token("ci", "push-token", true)
            .with_token("reader", "pull-token", false);

        assert_eq!(
            tokens.authenticate("push-token").await,
            Some(Principal {
                subject: "ci".into(),
                push: true,
            })
        );
        assert_eq!(
            tokens.authenticate("pull-token").await.map(|p| p.push),
            Some(false)
        );
        assert_eq!(tokens.authenticate("nope").await, None);
    }

    #[test]
    fn challenge_names_scope() {
        let gate = AuthGate {
            authenticator: Arc::new(StaticTokens::new()),
            realm: "https://auth.example.com/token".into(),
            service: "depot".into(),
        };

        let response = gate.challenge(Some("acme/app"), true);
        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            r#"Bearer realm="https://auth.example.com/token",service="depot",scope="repository:acme/app:push""#
        );

        let response = gate.challenge(None, false);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            r#"Bearer realm="https://auth.example.com/token",service="depot""#
        );
    }

    #[test]
    fn reads_are_get_and_head() {
        assert!(!is_write(&Method::GET));
        assert!(!is_write(&Method::HEAD));
        assert!(is_write(&Method::PATCH));
        assert!(is_write(&Method::DELETE));
    }
}
