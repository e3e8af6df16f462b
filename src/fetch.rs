//! Feed access: a thin HTTP seam plus the snapshot source the dispatcher
//! consumes.
//!
//! Two traits on purpose. [`HttpClient`] abstracts the transport so request
//! execution can be decorated (auth headers, retries) without touching
//! callers; [`FeedSource`] abstracts the whole fetch-and-parse step so the
//! dispatcher can be driven from scripted snapshots in tests.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Request, Response};

use crate::parser::{RawPosition, parse_snapshot};

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

/// Plain unauthenticated client; the operator's snapshot endpoint is public.
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> Self {
        Self(reqwest::Client::new())
    }
}

impl Default for BasicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        self.0.execute(req).await
    }
}

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?;
    Ok(resp.bytes().await?.to_vec())
}

/// Where the dispatcher gets its fleet snapshots from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<RawPosition>>;
}

/// Fetches and decodes snapshots from the operator's HTTP endpoint.
pub struct HttpFeed<C: HttpClient> {
    client: C,
    url: String,
}

impl<C: HttpClient> HttpFeed<C> {
    pub fn new(client: C, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl<C: HttpClient> FeedSource for HttpFeed<C> {
    async fn snapshot(&self) -> Result<Vec<RawPosition>> {
        let bytes = fetch_bytes(&self.client, &self.url).await?;
        parse_snapshot(&bytes)
    }
}
