//! Shared test doubles: a scripted chat service, deterministic embeddings,
//! and small fixture builders.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::embeddings::EmbeddingApi;
use crate::error::{EngineError, Result};
use crate::llm::{ChatApi, ChatRequest};
use crate::types::{File, Location, Meta, Source, Unit, UnitKind};

/// Replays canned responses in order and records every request.
pub struct ScriptedChat {
    replies: Mutex<VecDeque<Result<String>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn replying(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from([Err(EngineError::Ai(message.to_string()))])),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChatApi for ScriptedChat {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        self.requests.lock().push(request);
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::Ai("scripted chat exhausted".to_string())))
    }
}

/// Deterministic embeddings: similar texts get similar directions by
/// hashing words into a small vector space.
pub struct StubEmbeddings;

#[async_trait]
impl EmbeddingApi for StubEmbeddings {
    async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.05f32; 8];
                for word in text.split_whitespace() {
                    let mut hash = 2166136261u32;
                    for b in word.bytes() {
                        hash ^= b as u32;
                        hash = hash.wrapping_mul(16777619);
                    }
                    v[(hash % 8) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Always errors.
pub struct FailingEmbeddings;

#[async_trait]
impl EmbeddingApi for FailingEmbeddings {
    async fn embed(&self, _model: &str, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(EngineError::Ai("embedding service unavailable".to_string()))
    }
}

pub fn source_for(unit_id: &str, text: &str) -> Source {
    Source {
        unit: Unit {
            id: unit_id.to_string(),
            kind: UnitKind::Text,
            text: text.to_string(),
            location: Location {
                page: Some(1),
                ..Default::default()
            },
        },
        file: File {
            id: "f1".to_string(),
            name: "doc.pdf".to_string(),
        },
        meta: Meta::default(),
    }
}

/// Sources keyed by their global id, unit ids matching the global ids.
pub fn text_sources(entries: &[(usize, &str)]) -> HashMap<String, Source> {
    entries
        .iter()
        .map(|(id, text)| (id.to_string(), source_for(&id.to_string(), text)))
        .collect()
}
