use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine as _;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Credentials accepted by the HTTP transports. With nothing configured every
/// request is admitted.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub bearer_token: Option<String>,
    pub basic: Option<BasicCredentials>,
}

impl AuthConfig {
    pub fn is_open(&self) -> bool {
        self.bearer_token.is_none() && self.basic.is_none()
    }

    /// True if any configured mechanism accepts the request.
    pub fn admits(&self, headers: &HeaderMap, query: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }

        let authorization = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok());

        if let Some(expected) = &self.bearer_token {
            let from_header = authorization.and_then(|s| s.strip_prefix("Bearer "));
            if from_header.is_some_and(|t| ct_eq(t.trim(), expected)) {
                return true;
            }
            // Browser EventSource clients cannot set headers.
            if query_token(query).is_some_and(|t| ct_eq(&t, expected)) {
                return true;
            }
        }

        if let Some(creds) = &self.basic
            && let Some((user, pass)) = authorization.and_then(decode_basic)
        {
            // Evaluate both halves so timing does not reveal which one failed.
            let user_ok = ct_eq(&user, &creds.username);
            let pass_ok = ct_eq(&pass, &creds.password);
            if user_ok & pass_ok {
                return true;
            }
        }

        false
    }

    fn challenge(&self) -> &'static str {
        if self.basic.is_some() {
            r#"Basic realm="droidnotify""#
        } else {
            "Bearer"
        }
    }
}

fn ct_eq(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn query_token(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
}

fn decode_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(raw).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

pub async fn require_auth(
    State(auth): State<Arc<AuthConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !auth.admits(request.headers(), request.uri().query()) {
        tracing::debug!(path = %request.uri().path(), "rejecting unauthenticated request");
        return Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("content-type", "application/json")
            .header(WWW_AUTHENTICATE, auth.challenge())
            .body(Body::from(
                r#"{"code":"unauthorized","message":"missing or invalid credentials"}"#,
            ))
            .unwrap_or_else(|_| Response::new(Body::empty()));
    }

    next.run(request).await
}
