// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Token-authorized shard transfer over HTTP. Uploads (`POST
//! /shards/:hash?token=`) stream into the shard store behind a running
//! hash check; downloads (`GET /shards/:hash?token=`) stream back out.
//! Every request consumes a token previously granted by the CONSIGN or
//! RETRIEVE handlers, and the token is released whether or not the
//! transfer succeeds.

mod client;
mod tokens;

pub use client::{ShardClient, TransferError};
pub use tokens::{
    generate_token, AccessError, Operation, TokenEntry, TokenTable, TOKEN_TTL_MS,
};

use crate::crypto;
use crate::store::{Error as StoreError, StorageAdapter, StorageManager};
use crate::utils::{is_hex_string, Clock};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// The token-gated HTTP(S) endpoint for shard bytes.
pub struct ShardServer<DB> {
    manager: Arc<StorageManager<DB>>,
    tokens: Arc<TokenTable>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

impl<DB> ShardServer<DB>
where
    DB: StorageAdapter + Send + Sync + 'static,
{
    pub fn new(
        manager: Arc<StorageManager<DB>>,
        tokens: Arc<TokenTable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ShardServer {
            manager,
            tokens,
            clock,
        }
    }

    /// The token table handlers grant transfer authorizations through.
    pub fn tokens(&self) -> &Arc<TokenTable> {
        &self.tokens
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/shards/{hash}", post(upload::<DB>).get(download::<DB>))
            .with_state(self.clone())
    }

    /// Serve until the listener fails or the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        let router = self.router();
        axum::serve(listener, router).await
    }
}

fn error_reply(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "code": status.as_u16(), "message": message })),
    )
        .into_response()
}

fn access_error_reply(error: AccessError) -> Response {
    error_reply(StatusCode::UNAUTHORIZED, &error.to_string())
}

async fn upload<DB>(
    State(server): State<Arc<ShardServer<DB>>>,
    Path(hash): Path<String>,
    Query(query): Query<TokenQuery>,
    body: Body,
) -> Response
where
    DB: StorageAdapter + Send + Sync + 'static,
{
    if !is_hex_string(&hash, 40) {
        return error_reply(StatusCode::BAD_REQUEST, "Invalid shard hash");
    }
    let Some(token) = query.token else {
        return error_reply(StatusCode::UNAUTHORIZED, "Transfer token required");
    };
    let entry = match server.tokens.authorize(&token, &hash, Operation::Push) {
        Ok(entry) => entry,
        Err(error) => return access_error_reply(error),
    };

    let sink = match server.manager.shard_writer(&hash).await {
        Ok(sink) => sink,
        Err(StoreError::AlreadyStored(_)) => {
            server.tokens.release(&token);
            return error_reply(StatusCode::BAD_REQUEST, "Shard already stored");
        }
        Err(error) => {
            server.tokens.release(&token);
            warn!(%error, %hash, "failed to open shard writer");
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Storage unavailable");
        }
    };

    let mut sink = sink;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;
    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                let _ = sink.abort().await;
                server.tokens.release(&token);
                debug!(%error, %hash, "upload stream failed");
                return error_reply(StatusCode::BAD_REQUEST, "Transfer interrupted");
            }
        };

        // A token can expire mid-transfer; the partial shard is
        // discarded when it does.
        if server.clock.now_ms() >= entry.expires_at {
            let _ = sink.abort().await;
            server.tokens.release(&token);
            return error_reply(StatusCode::UNAUTHORIZED, "The token has expired");
        }

        received += chunk.len() as u64;
        if let Some(limit) = entry.size_limit {
            if received > limit {
                let _ = sink.abort().await;
                server.tokens.release(&token);
                return error_reply(StatusCode::BAD_REQUEST, "Maximum shard size exceeded");
            }
        }

        hasher.update(&chunk);
        if let Err(error) = sink.write(&chunk).await {
            let _ = sink.abort().await;
            server.tokens.release(&token);
            warn!(%error, %hash, "failed to persist shard chunk");
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Storage unavailable");
        }
    }

    let digest: [u8; 32] = hasher.finalize().into();
    let computed = hex::encode(crypto::ripemd160(&digest));
    if computed != hash {
        let _ = sink.abort().await;
        server.tokens.release(&token);
        debug!(%hash, %computed, "uploaded shard hash mismatch");
        return error_reply(
            StatusCode::BAD_REQUEST,
            "Calculated hash does not match the expected result",
        );
    }

    if let Err(error) = sink.commit().await {
        server.tokens.release(&token);
        warn!(%error, %hash, "failed to commit shard");
        return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Storage unavailable");
    }

    server.manager.check_capacity();
    server.tokens.release(&token);
    debug!(%hash, received, "shard consigned");
    (StatusCode::OK, Json(json!({}))).into_response()
}

async fn download<DB>(
    State(server): State<Arc<ShardServer<DB>>>,
    Path(hash): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Response
where
    DB: StorageAdapter + Send + Sync + 'static,
{
    if !is_hex_string(&hash, 40) {
        return error_reply(StatusCode::BAD_REQUEST, "Invalid shard hash");
    }
    let Some(token) = query.token else {
        return error_reply(StatusCode::UNAUTHORIZED, "Transfer token required");
    };
    if let Err(error) = server.tokens.authorize(&token, &hash, Operation::Pull) {
        return access_error_reply(error);
    }

    let reader = match server.manager.shard_reader(&hash).await {
        Ok(reader) => reader,
        Err(StoreError::ShardNotFound(_)) => {
            server.tokens.release(&token);
            return error_reply(StatusCode::NOT_FOUND, "Shard not found");
        }
        Err(error) => {
            server.tokens.release(&token);
            warn!(%error, %hash, "failed to open shard reader");
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Storage unavailable");
        }
    };

    // The token is held active for the lifetime of the response body and
    // released when the stream is dropped.
    let guard = TokenGuard {
        tokens: server.tokens.clone(),
        token,
    };
    let stream = ReaderStream::new(reader).map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .body(Body::from_stream(stream))
        .expect("static response parts are valid")
}

struct TokenGuard {
    tokens: Arc<TokenTable>,
    token: String,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.tokens.release(&self.token);
    }
}
