// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A reporter for continuous-profiling ingestion endpoints.
//!
//! Each [`TagCollection`] becomes one request:
//!
//! ```text
//! POST <server>/ingest?name=<app>{<tags>}&from=<unix>&until=<unix>&sampleRate=<n>&format=folded
//! Content-Type: text/plain
//!
//! main;handle;parse 12
//! main;handle;render 3
//! ```

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::{fmt, time::Duration};
use thiserror::Error;
use url::Url;

use crate::collector::TagCollection;

use super::Reporter;

/// Errors from setting up or talking to the ingestion endpoint.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IngestError {
    /// The server address does not form a valid URL.
    #[error("invalid server address {address:?}: {source}")]
    InvalidAddress {
        /// Address as configured.
        address: String,
        /// Why it did not parse.
        #[source]
        source: url::ParseError,
    },
    /// The HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    /// The request failed before a response arrived.
    #[error("failed to send profile data: {0}")]
    Transport(#[source] reqwest::Error),
    /// The endpoint answered with a non-success status.
    #[error("ingestion endpoint returned {status}: {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Decoded error body.
        message: String,
    },
}

impl IngestError {
    /// The HTTP status behind this error, if the endpoint answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            Self::InvalidAddress { .. } | Self::Client(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    code: Option<serde_json::Value>,
    message: Option<String>,
}

/// Turn a failed response body into an error message, preferring the JSON
/// `{"code": .., "message": ..}` envelope when there is one.
fn error_message(body: &str) -> String {
    if let Ok(ErrorEnvelope {
        code,
        message: Some(message),
    }) = serde_json::from_str(body)
    {
        return match code {
            Some(serde_json::Value::String(code)) => format!("{code}: {message}"),
            Some(serde_json::Value::Null) | None => message,
            Some(code) => format!("{code}: {message}"),
        };
    }
    let body = body.trim();
    if body.is_empty() {
        "empty response body".to_owned()
    } else {
        body.to_owned()
    }
}

fn tag_key(pair: &str) -> &str {
    pair.split_once('=').map_or(pair, |(key, _)| key)
}

/// Settings for [`IngestReporter`].
#[derive(Debug, Clone)]
pub struct IngestReporterConfig {
    /// Base URL of the ingestion server, e.g. `http://pyroscope:4040`.
    pub server_address: String,
    /// Series name the tags are attached to.
    pub application_name: String,
    /// Canonical static tag string added to every upload.
    pub static_tags: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    /// Samples per second, reported as `sampleRate`.
    pub sample_rate: u32,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for IngestReporterConfig {
    fn default() -> Self {
        Self {
            server_address: "http://localhost:4040".into(),
            application_name: String::new(),
            static_tags: String::new(),
            auth_token: None,
            sample_rate: 100,
            timeout: Duration::from_secs(10),
        }
    }
}

/// A reporter for an HTTP ingestion endpoint.
pub struct IngestReporter {
    client: reqwest::Client,
    endpoint: Url,
    application_name: String,
    static_tags: String,
    auth_token: Option<String>,
    sample_rate: u32,
}

impl IngestReporter {
    /// Makes a new one.
    pub fn new(config: IngestReporterConfig) -> Result<Self, IngestError> {
        let address = format!("{}/ingest", config.server_address.trim_end_matches('/'));
        let endpoint = Url::parse(&address).map_err(|source| IngestError::InvalidAddress {
            address: config.server_address.clone(),
            source,
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(IngestError::Client)?;

        Ok(Self {
            client,
            endpoint,
            application_name: config.application_name,
            static_tags: config.static_tags,
            auth_token: config.auth_token,
            sample_rate: config.sample_rate,
        })
    }

    /// `<app>{<static and sample tags, sorted by key>}`
    fn series_name(&self, tags: &str) -> String {
        let mut pairs: Vec<&str> = self
            .static_tags
            .split(',')
            .chain(tags.split(','))
            .filter(|pair| !pair.is_empty())
            .collect();
        pairs.sort_by(|a, b| tag_key(a).cmp(tag_key(b)));
        format!("{}{{{}}}", self.application_name, pairs.join(","))
    }

    fn request_url(&self, collection: &TagCollection) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("name", &self.series_name(&collection.tags))
            .append_pair("from", &collection.from.timestamp().to_string())
            .append_pair("until", &collection.until.timestamp().to_string())
            .append_pair("sampleRate", &self.sample_rate.to_string())
            .append_pair("format", "folded");
        url
    }

    /// Upload one collection.
    pub async fn report_collection(&self, collection: &TagCollection) -> Result<(), IngestError> {
        let url = self.request_url(collection);
        tracing::debug!(%url, bytes = collection.byte_length(), "uploading profile data");

        let mut request = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(collection.body());
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(IngestError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(IngestError::Transport)?;
        if status == StatusCode::OK && body.trim().is_empty() {
            return Ok(());
        }
        Err(IngestError::Rejected {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }
}

#[async_trait]
impl Reporter for IngestReporter {
    async fn report(
        &self,
        collection: &TagCollection,
    ) -> Result<(), Box<dyn std::error::Error + Send>> {
        self.report_collection(collection)
            .await
            .map_err(|e| Box::new(e) as _)
    }
}

impl fmt::Debug for IngestReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keep the auth token out of logs
        f.debug_struct("IngestReporter")
            .field("endpoint", &self.endpoint.as_str())
            .field("application_name", &self.application_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};
    use httpmock::prelude::*;

    use super::*;

    fn collection(tags: &str) -> TagCollection {
        TagCollection {
            tags: tags.into(),
            from: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            until: Utc.timestamp_opt(1_700_000_010, 0).unwrap(),
            data: HashMap::from([("main;work".to_owned(), 3), ("main".to_owned(), 1)]),
        }
    }

    fn reporter(
        server: &MockServer,
        static_tags: &str,
        auth_token: Option<&str>,
    ) -> IngestReporter {
        IngestReporter::new(IngestReporterConfig {
            server_address: server.base_url(),
            application_name: "my.app".into(),
            static_tags: static_tags.into(),
            auth_token: auth_token.map(Into::into),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"code":"invalid_argument","message":"bad name"}"#),
            "invalid_argument: bad name"
        );
        assert_eq!(error_message(r#"{"code":3,"message":"bad"}"#), "3: bad");
        assert_eq!(error_message(r#"{"message":"bad"}"#), "bad");
        assert_eq!(error_message("  upstream timeout\n"), "upstream timeout");
        assert_eq!(error_message(r#"{"other":1}"#), r#"{"other":1}"#);
        assert_eq!(error_message(""), "empty response body");
    }

    #[test]
    fn test_invalid_address() {
        let err = IngestReporter::new(IngestReporterConfig {
            server_address: "not a url".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidAddress { .. }));
    }

    #[test]
    fn test_series_name() {
        let make = |static_tags: &str| {
            IngestReporter::new(IngestReporterConfig {
                application_name: "app".into(),
                static_tags: static_tags.into(),
                ..Default::default()
            })
            .unwrap()
        };
        assert_eq!(make("").series_name(""), "app{}");
        assert_eq!(make("env=prod").series_name(""), "app{env=prod}");
        assert_eq!(make("").series_name("uri=/x"), "app{uri=/x}");
        assert_eq!(make("env=prod").series_name("uri=/x"), "app{env=prod,uri=/x}");
        assert_eq!(
            make("zone=b").series_name("app.version=2,host=h1"),
            "app{app.version=2,host=h1,zone=b}"
        );
        assert_eq!(make("a.b=1").series_name("a=2"), "app{a=2,a.b=1}");
    }

    #[tokio::test]
    async fn test_upload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/ingest")
                    .query_param("name", "my.app{env=prod,uri=/x}")
                    .query_param("from", "1700000000")
                    .query_param("until", "1700000010")
                    .query_param("sampleRate", "100")
                    .query_param("format", "folded")
                    .header("content-type", "text/plain")
                    .header("authorization", "Bearer s3cret")
                    .body("main 1\nmain;work 3\n");
                then.status(200);
            })
            .await;

        reporter(&server, "env=prod", Some("s3cret"))
            .report_collection(&collection("uri=/x"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_rejected_with_envelope() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/ingest");
                then.status(400)
                    .header("content-type", "application/json")
                    .body(r#"{"code":"invalid_argument","message":"bad tags"}"#);
            })
            .await;

        let err = reporter(&server, "", None)
            .report_collection(&collection(""))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(
            err.to_string(),
            "ingestion endpoint returned 400: invalid_argument: bad tags"
        );
    }

    #[tokio::test]
    async fn test_ok_with_unexpected_body_is_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/ingest");
                then.status(200).body("something odd");
            })
            .await;

        let err = reporter(&server, "", None)
            .report(&collection(""))
            .await
            .unwrap_err();
        let err = err.downcast_ref::<IngestError>().unwrap();
        assert_eq!(err.status(), Some(200));
        assert!(err.to_string().ends_with("something odd"), "{err}");
    }

    #[tokio::test]
    async fn test_transport_error() {
        // nothing listens on port 9 (discard) on test machines
        let reporter = IngestReporter::new(IngestReporterConfig {
            server_address: "http://127.0.0.1:9".into(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let err = reporter
            .report_collection(&collection(""))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Transport(_)), "{err:?}");
        assert_eq!(err.status(), None);
    }
}
