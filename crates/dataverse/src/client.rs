//! HTTP transport for the Dataverse adapter
//!
//! Wraps reqwest and adds what every repository call needs: the API key
//! header, transport-level retry with backoff, a concurrency ceiling and the
//! mapping of HTTP failures onto the shared error taxonomy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dvu_core::{
    Error, Resource, Result, RetryConfig, UploaderConfig, is_retryable_error, retry_with_backoff,
};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::multipart::Form;
use reqwest::{Body, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::api::ErrorBody;

/// Header carrying the Dataverse API token
pub const API_KEY_HEADER: &str = "X-Dataverse-key";

const USER_AGENT: &str = concat!("dvuploader/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

/// Pooled, authenticated HTTP client
///
/// Dropping the client closes its idle connections.
pub struct HttpClient {
    inner: reqwest::Client,
    api_key: String,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new(config: &UploaderConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.http_concurrency);

        if config.trust_all_certs {
            tracing::warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let inner = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner,
            api_key: config.api_key.clone(),
            retry: config.http_retry.clone(),
            permits: Arc::new(Semaphore::new(config.http_concurrency)),
        })
    }

    /// Authenticated GET, decoding the JSON response
    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T> {
        let body = self
            .send(url, move || async move {
                Ok(self.authenticated(self.inner.get(url.clone())))
            })
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Authenticated POST with a JSON body
    pub async fn post_json<B, T>(&self, url: &Url, payload: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let body = self
            .send(url, move || async move {
                Ok(self.authenticated(self.inner.post(url.clone()).json(payload)))
            })
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Authenticated multipart POST
    ///
    /// The form is rebuilt for every attempt so streamed parts start from
    /// the beginning of their source.
    pub async fn post_multipart<F, Fut, T>(&self, url: &Url, build_form: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Form>>,
        T: DeserializeOwned,
    {
        let build_form = &build_form;
        let body = self
            .send(url, move || async move {
                let form = build_form().await?;
                Ok(self.authenticated(self.inner.post(url.clone()).multipart(form)))
            })
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Stream a file to a pre-signed destination
    ///
    /// The destination belongs to the storage backend, so no repository
    /// credential is sent.
    pub async fn put_resource(&self, url: &Url, file: &Resource) -> Result<()> {
        let length = file.length()?;
        self.send(url, move || async move {
            let reader = file.open(0, None).await?;
            Ok(self
                .inner
                .put(url.clone())
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, length)
                .body(Body::wrap_stream(ReaderStream::new(reader))))
        })
        .await?;
        Ok(())
    }

    fn authenticated(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(API_KEY_HEADER, &self.api_key)
    }

    /// Run one request with retry and return the response body
    async fn send<F, Fut>(&self, url: &Url, build: F) -> Result<String>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<reqwest::RequestBuilder>>,
    {
        let build = &build;
        let target = display_url(url);
        let target = target.as_str();

        retry_with_backoff(
            &self.retry,
            move || async move {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| Error::General("HTTP client is closed".into()))?;

                tracing::debug!(url = %target, "Sending request");
                let response = build()
                    .await?
                    .send()
                    .await
                    .map_err(|e| transport_error(target, e))?;
                read_response(target, response).await
            },
            is_retryable_error,
        )
        .await
    }
}

async fn read_response(target: &str, response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(target, e))?;

    if status.is_success() {
        return Ok(body);
    }

    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| truncate(&body, MAX_ERROR_BODY));
    tracing::debug!(url = %target, status = status.as_u16(), %message, "Request failed");

    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Auth(message));
    }
    Err(Error::Http {
        status: status.as_u16(),
        message,
    })
}

/// Map a reqwest failure that produced no response
fn transport_error(target: &str, e: reqwest::Error) -> Error {
    if e.is_builder() {
        Error::General(format!("Invalid request to {target}: {e}"))
    } else if e.is_timeout() {
        Error::Network(format!("Request to {target} timed out"))
    } else if e.is_connect() {
        Error::Network(format!("Connection to {target} failed: {e}"))
    } else {
        Error::Network(format!("Request to {target} failed: {e}"))
    }
}

/// URL without query string; pre-signed URLs carry credentials there
fn display_url(url: &Url) -> String {
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    format!(
        "{}://{}{port}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.path()
    )
}

fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
