//! HTTP form login portal
//!
//! POSTs `account` and `secret` as a form to a login endpoint and expects a
//! JSON body with the issued token. Uses reqwest's blocking client, built per
//! login on the calling (blocking) thread so no runtime is ever created or
//! dropped inside an async context.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;

use crate::classify::classify_status;
use crate::{ErrorKind, IssuedToken, LoginPortal, PortalError, Result};

/// Successful login response body.
///
/// `expires_in` is a delta in seconds; it is converted to an absolute unix
/// millisecond timestamp on receipt.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Login portal that authenticates against an HTTP form endpoint.
pub struct HttpPortal {
    login_url: String,
    api_key: Option<Secret<String>>,
    timeout: Duration,
}

impl HttpPortal {
    pub fn new(login_url: impl Into<String>, api_key: Option<Secret<String>>, timeout: Duration) -> Self {
        Self {
            login_url: login_url.into(),
            api_key,
            timeout,
        }
    }
}

impl LoginPortal for HttpPortal {
    fn id(&self) -> &str {
        "http"
    }

    fn login(&self, account: &str, secret: &Secret<String>) -> Result<IssuedToken> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| PortalError::new(ErrorKind::Validation, format!("building HTTP client: {e}")))?;

        let mut request = client
            .post(&self.login_url)
            .form(&[("account", account), ("secret", secret.expose().as_str())]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose());
        }

        let response = request.send().map_err(|e| {
            let kind = if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::Network
            };
            PortalError::new(kind, format!("login request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(PortalError::new(
                classify_status(status.as_u16(), &body),
                format!("login endpoint returned {status}: {body}"),
            ));
        }

        let body: LoginResponse = response
            .json()
            .map_err(|e| PortalError::new(ErrorKind::Unknown, format!("invalid login response: {e}")))?;

        let expires_at = body
            .expires_in
            .map(|secs| common::now_millis() + secs * 1000);

        Ok(IssuedToken {
            token: Secret::new(body.token),
            expires_at,
        })
    }
}
