use std::collections::VecDeque;

use crate::cache::CacheKey;
use crate::glossary::GlossaryContext;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_CHARS: usize = 60_000;

/// One unique source text queued for translation, with every id that shares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub key: CacheKey,
    pub ids: Vec<String>,
    pub source: String,
    pub payload: String,
    pub placeholders: Vec<String>,
    pub tokens: Vec<String>,
    pub glossary: GlossaryContext,
}

impl BatchItem {
    pub fn char_len(&self) -> usize {
        self.payload.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_chars: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_BATCH_SIZE,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub items: Vec<BatchItem>,
    pub char_count: usize,
    pub target_lang: String,
    pub oversized: bool,
    pub attempts: u32,
}

impl Batch {
    pub fn new(target_lang: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            char_count: 0,
            target_lang: target_lang.into(),
            oversized: false,
            attempts: 0,
        }
    }

    /// Builds a retry batch from a subset of another batch's items.
    pub fn from_items(items: Vec<BatchItem>, target_lang: &str, attempts: u32) -> Self {
        let char_count = items.iter().map(BatchItem::char_len).sum();
        let mut batch = Self::new(target_lang);
        batch.items = items;
        batch.char_count = char_count;
        batch.attempts = attempts;
        batch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Splits into two halves; `None` for a singleton.
    pub fn split(self) -> Option<(Batch, Batch)> {
        if self.items.len() < 2 {
            return None;
        }
        let mut first = self.items;
        let second = first.split_off(first.len() / 2);
        Some((
            Batch::from_items(first, &self.target_lang, self.attempts),
            Batch::from_items(second, &self.target_lang, self.attempts),
        ))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .flat_map(|item| item.ids.iter().map(String::as_str))
    }

    fn push(&mut self, item: BatchItem) {
        self.char_count += item.char_len();
        self.items.push(item);
    }
}

/// Greedy packer: items keep arrival order, batches seal at either limit.
#[derive(Debug)]
pub struct Batcher {
    limits: BatchLimits,
    target_lang: String,
    ready: VecDeque<Batch>,
    open: Option<Batch>,
}

impl Batcher {
    pub fn new(limits: BatchLimits, target_lang: impl Into<String>) -> Self {
        Self {
            limits,
            target_lang: target_lang.into(),
            ready: VecDeque::new(),
            open: None,
        }
    }

    pub fn enqueue(&mut self, items: impl IntoIterator<Item = BatchItem>) {
        for item in items {
            self.push_item(item);
        }
    }

    pub fn next_batch(&mut self) -> Option<Batch> {
        if let Some(batch) = self.ready.pop_front() {
            return Some(batch);
        }
        self.open.take().filter(|batch| !batch.is_empty())
    }

    pub fn requeue_front(&mut self, batch: Batch) {
        if !batch.is_empty() {
            self.ready.push_front(batch);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.open.as_ref().is_none_or(Batch::is_empty)
    }

    pub fn pending_len(&self) -> usize {
        self.ready.iter().map(Batch::len).sum::<usize>()
            + self.open.as_ref().map(Batch::len).unwrap_or(0)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.ready
            .iter()
            .chain(self.open.iter())
            .flat_map(|batch| batch.ids().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    /// Removes every queued batch.
    fn push_item(&mut self, item: BatchItem) {
        let chars = item.char_len();
        if chars > self.limits.max_chars {
            self.seal();
            let mut batch = Batch::new(self.target_lang.clone());
            batch.oversized = true;
            batch.push(item);
            self.ready.push_back(batch);
            return;
        }

        let fits = self.open.as_ref().is_none_or(|open| {
            open.len() < self.limits.max_items && open.char_count + chars <= self.limits.max_chars
        });
        if !fits {
            self.seal();
        }
        self.open
            .get_or_insert_with(|| Batch::new(self.target_lang.clone()))
            .push(item);
        if self
            .open
            .as_ref()
            .is_some_and(|open| open.len() >= self.limits.max_items)
        {
            self.seal();
        }
    }

    fn seal(&mut self) {
        if let Some(open) = self.open.take().filter(|batch| !batch.is_empty()) {
            self.ready.push_back(open);
        }
    }
}
