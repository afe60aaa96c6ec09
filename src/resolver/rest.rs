//! Authenticated JSON calls shared by the cloud backends.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::ResolveError;

/// Supplies `Authorization` header values for cloud API calls.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// A ready-to-send header value, `"Bearer <token>"`.
    async fn bearer_header(&self) -> Result<Arc<str>, ResolveError>;
}

/// A fixed token, for tests and for tokens minted outside the process.
#[derive(Clone)]
pub struct StaticToken(Arc<str>);

impl StaticToken {
    pub fn new(token: &str) -> Self {
        Self(format!("Bearer {token}").into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticToken").field(&"****").finish()
    }
}

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn bearer_header(&self) -> Result<Arc<str>, ResolveError> {
        Ok(self.0.clone())
    }
}

/// reqwest client paired with a token source.
#[derive(Clone)]
pub(crate) struct RestClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl RestClient {
    pub(crate) fn new(http: reqwest::Client, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self { http, tokens }
    }

    pub(crate) fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http.get(url)
    }

    pub(crate) fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.http.post(url)
    }

    /// Send `request` with a bearer token and decode a JSON response.
    ///
    /// `context` names the operation in error messages.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T, ResolveError> {
        let bearer = self.tokens.bearer_header().await?;
        let response = request
            .header(http::header::AUTHORIZATION, bearer.as_ref())
            .header(http::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(format!("{context}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResolveError::from_status(status, context, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ResolveError::Upstream(format!("{context}: invalid response body: {e}")))
    }
}
