//! Redis-backed storage and run queue
//!
//! Records are JSON strings under `grader:<kind>:<id>`. Run requests arrive on
//! a list consumed with BLPOP; terminal runs are stored and published so that
//! pollers and subscribers both see them.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use uuid::Uuid;

use super::Store;
use crate::error::StoreError;
use crate::models::{File, Run, RunRequest, Submission, Test};

/// Redis key constants
pub mod keys {
    /// Run request queue (JSON `RunRequest`)
    pub const RUN_QUEUE: &str = "grader:runs:queue";

    /// Cancellation queue (run id)
    pub const CANCEL_QUEUE: &str = "grader:runs:cancel";

    /// Run record key prefix (for polling)
    pub const RUN_PREFIX: &str = "grader:run:";

    /// Terminal run channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "grader:runs:results";

    pub const TEST_PREFIX: &str = "grader:test:";
    pub const SUBMISSION_PREFIX: &str = "grader:submission:";
    pub const FILE_PREFIX: &str = "grader:file:";

    /// Reporter channel
    pub const REPORT_CHANNEL: &str = "grader:reports";
}

/// `Store` over a shared, self-reconnecting connection
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", redis_url))?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }

    /// Connection handle for collaborators sharing this store's link
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
        kind: &'static str,
        id: &str,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(format!("{}{}", prefix, id)).await?;
        let raw = raw.ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_test(&self, id: &str) -> Result<Test, StoreError> {
        self.get_json(keys::TEST_PREFIX, "test", id).await
    }

    async fn get_submission(&self, id: &str) -> Result<Submission, StoreError> {
        self.get_json(keys::SUBMISSION_PREFIX, "submission", id).await
    }

    async fn get_file(&self, id: &str) -> Result<File, StoreError> {
        self.get_json(keys::FILE_PREFIX, "file", id).await
    }

    /// SET overwrites, so a repeated save leaves the same value behind
    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let json = serde_json::to_string(run)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(format!("{}{}", keys::RUN_PREFIX, run.id), &json)
            .await?;

        // Publish to channel (ignore errors as there may be no subscribers)
        if run.is_complete() {
            let _ = conn.publish::<_, _, ()>(keys::RESULT_CHANNEL, &json).await;
        }
        Ok(())
    }
}

/// Work item popped from Redis
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    Run(RunRequest),
    Cancel(Uuid),
}

impl QueueMessage {
    /// Decode the payload popped from `list`
    pub fn parse(list: &str, payload: &str) -> Result<Self> {
        match list {
            keys::RUN_QUEUE => Ok(QueueMessage::Run(
                serde_json::from_str(payload).context("Invalid run request")?,
            )),
            keys::CANCEL_QUEUE => Ok(QueueMessage::Cancel(
                payload.trim().trim_matches('"').parse().context("Invalid run id")?,
            )),
            other => anyhow::bail!("Unexpected queue '{}'", other),
        }
    }
}

/// Blocking consumer of the run and cancel lists.
///
/// Holds its own connection: BLPOP parks the connection it runs on, so it
/// must not share the store's.
pub struct RunQueue {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RunQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        Ok(Self { client, conn })
    }

    /// Block until the next well-formed message arrives.
    ///
    /// Reconnects on connection failure; malformed payloads are logged and skipped.
    pub async fn pop(&mut self) -> Result<QueueMessage> {
        loop {
            let result: Option<(String, String)> = match self
                .conn
                .blpop(vec![keys::CANCEL_QUEUE, keys::RUN_QUEUE], 0.0)
                .await
            {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.conn = get_connection_with_retry(&self.client).await?;
                    continue;
                }
            };

            if let Some((list, payload)) = result {
                match QueueMessage::parse(&list, &payload) {
                    Ok(message) => return Ok(message),
                    Err(e) => {
                        warn!("Failed to parse message: {:#}. Data: {}", e, payload);
                        continue;
                    }
                }
            }
        }
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
