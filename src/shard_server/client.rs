// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::node::Contact;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Default end-to-end timeout for a single shard transfer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Transfer rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

/// HTTP client side of the shard transfer protocol: pushes bytes to and
/// pulls bytes from a peer's shard endpoint with a transfer token.
#[derive(Debug, Clone)]
pub struct ShardClient {
    http: reqwest::Client,
}

impl Default for ShardClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .expect("client configuration is static");
        ShardClient { http }
    }

    /// `http://{address}:{port}/shards/{hash}`.
    pub fn shard_url(contact: &Contact, hash: &str) -> String {
        format!("http://{}:{}/shards/{}", contact.address, contact.port, hash)
    }

    /// Upload shard bytes under a PUSH token.
    pub async fn upload(
        &self,
        contact: &Contact,
        hash: &str,
        token: &str,
        body: reqwest::Body,
    ) -> Result<(), TransferError> {
        let response = self
            .http
            .post(Self::shard_url(contact, hash))
            .query(&[("token", token)])
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Open a download stream under a PULL token.
    pub async fn download(
        &self,
        contact: &Contact,
        hash: &str,
        token: &str,
    ) -> Result<impl Stream<Item = Result<Bytes, reqwest::Error>>, TransferError> {
        let response = self
            .http
            .get(Self::shard_url(contact, hash))
            .query(&[("token", token)])
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.bytes_stream())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<WireError>()
            .await
            .map(|e| e.message)
            .unwrap_or_default();
        Err(TransferError::Rejected {
            code: status.as_u16(),
            message,
        })
    }
}
