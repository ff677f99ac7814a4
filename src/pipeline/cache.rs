//! 纯文本调用缓存
//!
//! 键为完整调用签名 (provider, model, system_prompt, input, tools, memory) 的 sha256；
//! 并发读安全，写入后者覆盖前者。条目只是提示，不承载正确性。

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::CacheSection;
use crate::memory::MemoryContext;

/// 缓存键的组成
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub system_prompt: Option<&'a str>,
    pub input: &'a str,
    pub tools: &'a [String],
    pub memory: &'a MemoryContext,
}

impl CacheKey<'_> {
    pub fn digest(&self) -> String {
        let signature = json!({
            "provider": self.provider,
            "model": self.model,
            "system_prompt": self.system_prompt,
            "input": self.input,
            "tools": self.tools,
            "memory": self.memory,
        });
        hex::encode(Sha256::digest(signature.to_string().as_bytes()))
    }
}

#[derive(Debug)]
pub struct TextCallCache {
    enabled: bool,
    max_entries: usize,
    entries: RwLock<HashMap<String, Value>>,
}

impl TextCallCache {
    pub fn new(enabled: bool, max_entries: usize) -> Self {
        Self {
            enabled,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(section: &CacheSection) -> Self {
        Self::new(section.enabled, section.max_entries)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        match self.entries.read() {
            Ok(entries) => entries.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    /// 写入；满时先淘汰任意一条
    pub fn insert(&self, key: String, value: Value) {
        if !self.enabled {
            return;
        }
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }
        entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
