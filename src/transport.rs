//! An HTTP client for the Flagsense API.
//!
//! Every call is a JSON `POST` carrying the SDK credentials in headers. Failed calls (network
//! error or non-success status) are retried a fixed number of times with a fixed delay; whatever
//! happens after that is reported to the caller, which logs it and moves on.
use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    StatusCode, Url,
};
use serde::Serialize;

use crate::{ClientConfig, Error, Result};

const AUTH_TYPE_HEADER: HeaderName = HeaderName::from_static("authtype");
const SDK_ID_HEADER: HeaderName = HeaderName::from_static("sdkid");
const SDK_SECRET_HEADER: HeaderName = HeaderName::from_static("sdksecret");

/// API endpoints used by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    /// Configuration changes since a timestamp.
    FetchLatest,
    /// Evaluation, error and code-bug counters for one time slot.
    VariantsData,
    /// Experiment metrics for one time slot.
    ExperimentEvents,
}

impl Endpoint {
    pub(crate) fn path(self) -> &'static str {
        match self {
            Endpoint::FetchLatest => "fetchLatest",
            Endpoint::VariantsData => "variantsData",
            Endpoint::ExperimentEvents => "experimentEvents",
        }
    }
}

/// A client that talks to the Flagsense API.
///
/// Cheap to share: the underlying `reqwest::Client` holds a connection pool, so a single
/// instance should be reused for all requests.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    client: reqwest::Client,
    base_url: Url,
    events_base_url: Url,
    headers: HeaderMap,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Transport {
    pub(crate) const MAX_ATTEMPTS: u32 = 5;
    pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(5);

    pub(crate) fn new(config: &ClientConfig) -> Result<Transport> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTH_TYPE_HEADER, HeaderValue::from_static("sdk"));
        headers.insert(
            SDK_ID_HEADER,
            HeaderValue::from_str(&config.sdk_id).map_err(|_| Error::InvalidCredentials)?,
        );
        headers.insert(
            SDK_SECRET_HEADER,
            HeaderValue::from_str(&config.sdk_secret).map_err(|_| Error::InvalidCredentials)?,
        );

        Ok(Transport {
            client: reqwest::Client::new(),
            base_url: parse_base_url(&config.base_url)?,
            events_base_url: parse_base_url(&config.events_base_url)?,
            headers,
            max_attempts: Transport::MAX_ATTEMPTS,
            retry_delay: Transport::RETRY_DELAY,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_retry_policy(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// Post `body` to `endpoint` and return the raw response body.
    ///
    /// # Errors
    ///
    /// - [`Error::Network`] if the last attempt failed to connect or read the response.
    /// - [`Error::HttpStatus`] if the last response status was not `200 OK`.
    pub(crate) async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: Endpoint,
        body: &B,
    ) -> Result<Vec<u8>> {
        let url = self.url(endpoint)?;

        let mut attempt = 1;
        loop {
            match self.try_post(url.clone(), body).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.max_attempts => {
                    log::debug!(target: "flagsense",
                                endpoint = endpoint.path(),
                                attempt;
                                "request failed, retrying: {err}");
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_post<B: Serialize + ?Sized>(&self, url: Url, body: &B) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        Ok(response.bytes().await?.to_vec())
    }

    fn url(&self, endpoint: Endpoint) -> Result<Url> {
        let base = match endpoint {
            Endpoint::FetchLatest => &self.base_url,
            Endpoint::VariantsData | Endpoint::ExperimentEvents => &self.events_base_url,
        };
        base.join(endpoint.path()).map_err(Error::InvalidBaseUrl)
    }
}

/// Parse a base URL, making sure it ends with `/` so that endpoint paths are appended rather than
/// replacing the last path segment.
fn parse_base_url(base_url: &str) -> Result<Url> {
    let mut base_url = base_url.to_owned();
    if !base_url.ends_with('/') {
        base_url.push('/');
    }
    Url::parse(&base_url).map_err(Error::InvalidBaseUrl)
}
