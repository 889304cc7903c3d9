//! Persisted conversation log (spec §6 "Persisted conversation log").
//!
//! A list keyed by `conversation:<callId>`, TTL'd on every append. Logging
//! is best-effort and never fails a call (spec §7): both implementations
//! swallow write errors after logging them rather than propagating a
//! `Result` the orchestrator would have to react to.
//!
//! No teacher analogue (Discord voice bots don't persist a transcript
//! store); enrichment from the rest of the pack — the `redis` crate appears
//! across several `other_examples/manifests/` entries for exactly this
//! "append-only list with TTL" shape.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::ids::CallId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Caller,
    Bot,
    System,
    Error,
    Dtmf,
    ToolCall,
    ToolResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub content: String,
    pub call_id: CallId,
    pub tool_name: Option<String>,
    pub original_turn_timestamp: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append(&self, entry: ConversationEntry, ttl_seconds: u64);
    async fn history(&self, call_id: &CallId) -> Vec<ConversationEntry>;
}

fn redis_key(call_id: &CallId) -> String {
    format!("conversation:{}", call_id.as_str())
}

pub struct RedisConversationLog {
    manager: redis::aio::ConnectionManager,
}

impl RedisConversationLog {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl ConversationLog for RedisConversationLog {
    async fn append(&self, entry: ConversationEntry, ttl_seconds: u64) {
        let key = redis_key(&entry.call_id);
        let payload = match serde_json::to_string(&entry) {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, "failed to serialize conversation entry");
                return;
            }
        };
        let mut conn = self.manager.clone();
        let result: redis::RedisResult<()> = redis::pipe()
            .rpush(&key, payload)
            .ignore()
            .expire(&key, ttl_seconds as i64)
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(%err, call_id = %entry.call_id, "conversation log append failed, continuing");
        }
    }

    async fn history(&self, call_id: &CallId) -> Vec<ConversationEntry> {
        let key = redis_key(call_id);
        let mut conn = self.manager.clone();
        let raw: redis::RedisResult<Vec<String>> = redis::cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await;
        match raw {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|s| serde_json::from_str(&s).ok())
                .collect(),
            Err(err) => {
                warn!(%err, call_id = %call_id, "conversation log history read failed");
                Vec::new()
            }
        }
    }
}

/// In-memory fallback used by tests and when no `REDIS_URL` is configured.
#[derive(Default)]
pub struct InMemoryConversationLog {
    entries: Mutex<HashMap<CallId, VecDeque<ConversationEntry>>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn append(&self, entry: ConversationEntry, _ttl_seconds: u64) {
        let mut entries = self.entries.lock().await;
        entries.entry(entry.call_id.clone()).or_default().push_back(entry);
    }

    async fn history(&self, call_id: &CallId) -> Vec<ConversationEntry> {
        let entries = self.entries.lock().await;
        entries
            .get(call_id)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Builds the configured conversation log (Redis if `redis_url` is set,
/// in-memory otherwise).
pub async fn build(redis_url: Option<&str>) -> Arc<dyn ConversationLog> {
    match redis_url {
        Some(url) => match RedisConversationLog::connect(url).await {
            Ok(log) => Arc::new(log),
            Err(err) => {
                warn!(%err, "failed to connect to redis, falling back to in-memory conversation log");
                Arc::new(InMemoryConversationLog::new())
            }
        },
        None => Arc::new(InMemoryConversationLog::new()),
    }
}
