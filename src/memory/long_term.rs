//! 进程内记忆：短期对话、关键词语义检索、"记住：…" 画像事实
//!
//! KeywordMemory 按会话隔离短期与语义条目，画像事实按 agent 通道（agent_id，缺省为 AI profile 名）隔离。
//! 相似度为查询词与条目词的交集大小，无真实向量。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::json;

use super::{
    recall_hash, MemoryCollaborator, MemoryContext, MemoryItem, MemorySpace, RecallPack,
    RecallRequest, RecordPack, RecordRequest,
};
use crate::core::error::{Result, RuntimeError};
use crate::trace::MemoryFacts;

/// 语义检索返回条数
const SEMANTIC_TOP_K: usize = 3;

/// 从输入中提取「记住：xxx」/「remember: xxx」的内容
fn extract_remember_content(input: &str) -> Option<String> {
    let input = input.trim();
    let lower = input.to_lowercase();
    let (idx, marker_len) = match input.find("记住") {
        Some(i) => (i, "记住".len()),
        None => (lower.find("remember")?, "remember".len()),
    };
    let after = input.get(idx + marker_len..)?;
    let sep = after.find('：').or_else(|| after.find(':'))?;
    let sep_len = if after[sep..].starts_with('：') { '：'.len_utf8() } else { 1 };
    let content = after.get(sep + sep_len..)?.trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

/// 将文本切分为小写词集合
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

struct SemanticEntry {
    id: String,
    session: String,
    text: String,
    tokens: HashSet<String>,
}

#[derive(Default)]
struct KeywordStore {
    short_term: HashMap<String, Vec<MemoryItem>>,
    semantic: Vec<SemanticEntry>,
    /// 通道 -> (事实键 -> 事实)
    facts: HashMap<String, BTreeMap<String, String>>,
    next_id: u64,
}

impl KeywordStore {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// 关键词重叠记忆
pub struct KeywordMemory {
    store: RwLock<KeywordStore>,
    short_term_turns: usize,
    max_entries: usize,
}

impl KeywordMemory {
    pub fn new(short_term_turns: usize, max_entries: usize) -> Self {
        Self {
            store: RwLock::new(KeywordStore::default()),
            short_term_turns: short_term_turns.max(1),
            max_entries: max_entries.max(1),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KeywordStore>> {
        self.store
            .read()
            .map_err(|_| RuntimeError::Memory("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KeywordStore>> {
        self.store
            .write()
            .map_err(|_| RuntimeError::Memory("memory store lock poisoned".to_string()))
    }

    fn lane(agent_id: Option<&str>, profile_name: &str) -> String {
        match agent_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("ai:{}", profile_name),
        }
    }
}

impl Default for KeywordMemory {
    fn default() -> Self {
        Self::new(4, 1000)
    }
}

#[async_trait]
impl MemoryCollaborator for KeywordMemory {
    async fn recall_with_events(&self, request: RecallRequest<'_>) -> Result<RecallPack> {
        let config = &request.profile.memory;
        let session = self.session_id(request.state, request.identity);
        let mut payload = MemoryContext::default();
        let mut spaces = Vec::new();
        {
            let store = self.read()?;
            if config.short_term {
                spaces.push(MemorySpace::ShortTerm.as_str().to_string());
                if let Some(turns) = store.short_term.get(&session) {
                    let skip = turns.len().saturating_sub(self.short_term_turns);
                    for item in &turns[skip..] {
                        payload.push(item.clone());
                    }
                }
            }
            if config.semantic {
                spaces.push(MemorySpace::Semantic.as_str().to_string());
                let query_tokens = tokenize_lower(request.query);
                let mut scored: Vec<(usize, &SemanticEntry)> = store
                    .semantic
                    .iter()
                    .filter(|e| e.session == session)
                    .map(|e| (query_tokens.intersection(&e.tokens).count(), e))
                    .filter(|(score, _)| *score > 0)
                    .collect();
                // 稳定排序：同分保留写入顺序
                scored.sort_by(|a, b| b.0.cmp(&a.0));
                for (score, entry) in scored.into_iter().take(SEMANTIC_TOP_K) {
                    let mut item = MemoryItem::new(&entry.id, MemorySpace::Semantic, &entry.text);
                    item.meta = json!({"score": score});
                    payload.push(item);
                }
            }
            if config.profile {
                spaces.push(MemorySpace::Profile.as_str().to_string());
                let lane = Self::lane(request.agent_id, &request.profile.name);
                if let Some(facts) = store.facts.get(&lane) {
                    for (key, value) in facts {
                        payload.push(MemoryItem::new(
                            format!("fact:{}", key),
                            MemorySpace::Profile,
                            value,
                        ));
                    }
                }
            }
        }

        let hash = recall_hash(&payload);
        let events = vec![json!({
            "type": "memory_recall_audit",
            "session": session,
            "items": payload.item_count(),
            "recall_hash": hash,
        })];
        Ok(RecallPack {
            policy: json!({
                "short_term": config.short_term,
                "semantic": config.semantic,
                "profile": config.profile,
                "short_term_turns": self.short_term_turns,
                "semantic_top_k": SEMANTIC_TOP_K,
            }),
            payload,
            events,
            spaces_consulted: spaces,
            recall_hash: hash,
        })
    }

    async fn record_with_events(&self, request: RecordRequest<'_>) -> Result<RecordPack> {
        let config = &request.profile.memory;
        if !config.enabled() {
            return Ok(RecordPack::default());
        }
        let session = self.session_id(request.state, request.identity);
        let mut written = Vec::new();
        let mut store = self.write()?;

        if config.short_term {
            let id = store.next_id("st");
            let mut item = MemoryItem::new(
                id,
                MemorySpace::ShortTerm,
                format!("user: {}\nassistant: {}", request.input_text, request.output_text),
            );
            if !request.tool_events.is_empty() {
                item.meta = json!({"tool_events": request.tool_events.len()});
            }
            let turns = store.short_term.entry(session.clone()).or_default();
            turns.push(item.clone());
            let n = turns.len();
            if n > self.max_entries {
                turns.drain(0..n - self.max_entries);
            }
            written.push(item);
        }

        if config.semantic && !request.input_text.trim().is_empty() {
            let id = store.next_id("sem");
            let text = request.input_text.trim().to_string();
            store.semantic.push(SemanticEntry {
                id: id.clone(),
                session: session.clone(),
                tokens: tokenize_lower(&text),
                text: text.clone(),
            });
            let n = store.semantic.len();
            if n > self.max_entries {
                store.semantic.drain(0..n - self.max_entries);
            }
            written.push(MemoryItem::new(id, MemorySpace::Semantic, text));
        }

        if config.profile {
            if let Some(fact) = extract_remember_content(request.input_text) {
                let lane = Self::lane(request.agent_id, &request.profile.name);
                let facts = store.facts.entry(lane).or_default();
                let (key, value) = match fact.split_once('=') {
                    Some((k, v)) if !k.trim().is_empty() => {
                        (k.trim().to_lowercase(), v.trim().to_string())
                    }
                    _ => (format!("fact_{}", facts.len() + 1), fact.clone()),
                };
                facts.insert(key.clone(), value.clone());
                written.push(MemoryItem::new(
                    format!("fact:{}", key),
                    MemorySpace::Profile,
                    value,
                ));
            }
        }

        let events = vec![json!({
            "type": "memory_write_audit",
            "session": session,
            "written": written.len(),
        })];
        Ok(RecordPack { written, events })
    }

    fn agent_facts(&self, agent_id: &str) -> MemoryFacts {
        let keys: Vec<String> = match self.store.read() {
            Ok(store) => store
                .facts
                .get(agent_id)
                .map(|facts| facts.keys().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        MemoryFacts {
            total: keys.len(),
            keys,
            last_updated_step: None,
        }
    }
}

/// 空实现：不召回、不写入
#[derive(Debug, Clone, Default)]
pub struct NoopMemory;

#[async_trait]
impl MemoryCollaborator for NoopMemory {
    async fn recall_with_events(&self, _request: RecallRequest<'_>) -> Result<RecallPack> {
        let payload = MemoryContext::default();
        Ok(RecallPack {
            recall_hash: recall_hash(&payload),
            payload,
            policy: json!({}),
            ..RecallPack::default()
        })
    }

    async fn record_with_events(&self, _request: RecordRequest<'_>) -> Result<RecordPack> {
        Ok(RecordPack::default())
    }
}
