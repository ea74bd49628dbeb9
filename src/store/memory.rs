//! In-memory `RecordStore` with realtime fan-out and fault injection.
//!
//! Backs the engine tests and the agent's offline demo mode. Behaves like
//! the remote store where the engine can tell the difference: ids are
//! assigned server-side, filters are evaluated against the same expression
//! grammar, and every mutation is fanned out to live subscriptions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::{SyncError, SyncResult};
use crate::models::{format_backend_timestamp, EventAction, RecordEvent};
use crate::store::{ListOptions, RecordStore, Subscription};

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<(String, RecordEvent)>,
}

#[derive(Default)]
struct Inner {
    /// Collection name -> records in insertion order.
    collections: HashMap<String, Vec<(String, Value)>>,
    /// Queued failures per operation name, consumed one per call.
    faults: HashMap<String, VecDeque<SyncError>>,
    /// Operation log for assertions: (operation, collection).
    ops: Vec<(String, String)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    /// Insert a record directly, without emitting a realtime event.
    /// Returns the record id. Intended for seeding state before a scenario.
    pub fn seed(&self, collection: &str, mut record: Value) -> String {
        let mut inner = self.inner.lock().unwrap();
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_id);
        if let Some(obj) = record.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
            obj.entry("updated".to_string())
                .or_insert_with(|| Value::String(format_backend_timestamp(Utc::now())));
        }
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), record));
        id
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .and_then(|records| records.iter().find(|(rid, _)| rid == id))
            .map(|(_, value)| value.clone())
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .map(|records| records.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Queue a failure for the next call of `op`
    /// (`create`, `update`, `delete`, `get_one`, `get_first_list_item`,
    /// `get_full_list`).
    pub fn fail_next(&self, op: &str, error: SyncError) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .faults
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn op_count(&self, op: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ops.iter().filter(|(name, _)| name == op).count()
    }

    fn begin_op(&self, op: &str, collection: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push((op.to_string(), collection.to_string()));
        if let Some(fault) = inner.faults.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(fault);
        }
        Ok(())
    }

    fn emit(&self, collection: &str, action: EventAction, record: Value) {
        // No subscribers is fine.
        let _ = self
            .events
            .send((collection.to_string(), RecordEvent { action, record }));
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_one(&self, collection: &str, id: &str) -> SyncResult<Value> {
        self.begin_op("get_one", collection)?;
        self.record(collection, id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    async fn get_first_list_item(&self, collection: &str, filter: &str) -> SyncResult<Value> {
        self.begin_op("get_first_list_item", collection)?;
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .and_then(|records| {
                records
                    .iter()
                    .find(|(_, value)| filter::matches(value, filter))
            })
            .map(|(_, value)| value.clone())
            .ok_or_else(|| SyncError::NotFound(filter.to_string()))
    }

    async fn get_full_list(
        &self,
        collection: &str,
        options: &ListOptions,
    ) -> SyncResult<Vec<Value>> {
        self.begin_op("get_full_list", collection)?;
        let inner = self.inner.lock().unwrap();
        let mut items: Vec<Value> = inner
            .collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, value)| match &options.filter {
                        Some(filter) => filter::matches(value, filter),
                        None => true,
                    })
                    .map(|(_, value)| value.clone())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(sort) = &options.sort {
            let (key, descending) = match sort.strip_prefix('-') {
                Some(key) => (key, true),
                None => (sort.as_str(), false),
            };
            items.sort_by(|a, b| {
                let a = a.get(key).and_then(Value::as_str).unwrap_or("");
                let b = b.get(key).and_then(Value::as_str).unwrap_or("");
                if descending {
                    b.cmp(a)
                } else {
                    a.cmp(b)
                }
            });
        }

        Ok(items)
    }

    async fn create(&self, collection: &str, mut data: Value) -> SyncResult<Value> {
        self.begin_op("create", collection)?;
        let mut inner = self.inner.lock().unwrap();

        let id = data
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_id);
        let records = inner
            .collections
            .entry(collection.to_string())
            .or_default();
        if records.iter().any(|(rid, _)| rid == &id) {
            return Err(SyncError::Api {
                status: 400,
                message: format!("record {id} already exists"),
            });
        }

        let now = format_backend_timestamp(Utc::now());
        if let Some(obj) = data.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
            obj.insert("created".to_string(), Value::String(now.clone()));
            obj.insert("updated".to_string(), Value::String(now));
        }
        records.push((id, data.clone()));
        drop(inner);

        self.emit(collection, EventAction::Create, data.clone());
        Ok(data)
    }

    async fn update(&self, collection: &str, id: &str, data: Value) -> SyncResult<Value> {
        self.begin_op("update", collection)?;
        let mut inner = self.inner.lock().unwrap();

        let records = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let record = records
            .iter_mut()
            .find(|(rid, _)| rid == id)
            .map(|(_, value)| value)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        if let (Some(target), Some(patch)) = (record.as_object_mut(), data.as_object()) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
            target.insert(
                "updated".to_string(),
                Value::String(format_backend_timestamp(Utc::now())),
            );
        }
        let updated = record.clone();
        drop(inner);

        self.emit(collection, EventAction::Update, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        self.begin_op("delete", collection)?;
        let mut inner = self.inner.lock().unwrap();

        let records = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let position = records
            .iter()
            .position(|(rid, _)| rid == id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let (_, removed) = records.remove(position);
        drop(inner);

        self.emit(collection, EventAction::Delete, removed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> SyncResult<Subscription> {
        let mut feed = self.events.subscribe();
        let topic = topic.to_string();
        let (tx, rx) = mpsc::channel(64);

        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok((collection, event)) if collection == topic => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Realtime feed lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx, Some(task)))
    }
}

fn generate_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..15)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Evaluator for the store's string filter expressions. Supports the subset
/// the engine actually issues: comparisons on string/bool/number fields
/// combined with `&&`, `||` and parentheses.
mod filter {
    use serde_json::Value;

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Ident(String),
        Str(String),
        Bool(bool),
        Num(f64),
        Cmp(CmpOp),
        And,
        Or,
        LParen,
        RParen,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum CmpOp {
        Eq,
        Neq,
        Ge,
        Gt,
        Le,
        Lt,
    }

    pub fn matches(record: &Value, filter: &str) -> bool {
        let tokens = match tokenize(filter) {
            Some(tokens) => tokens,
            None => return false,
        };
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        match parser.parse_or(record) {
            Some(result) if parser.position == parser.tokens.len() => result,
            _ => false,
        }
    }

    fn tokenize(input: &str) -> Option<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();

        while let Some(&c) = chars.peek() {
            match c {
                ' ' | '\t' | '\n' => {
                    chars.next();
                }
                '(' => {
                    chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    chars.next();
                    tokens.push(Token::RParen);
                }
                '&' => {
                    chars.next();
                    if chars.next() != Some('&') {
                        return None;
                    }
                    tokens.push(Token::And);
                }
                '|' => {
                    chars.next();
                    if chars.next() != Some('|') {
                        return None;
                    }
                    tokens.push(Token::Or);
                }
                '=' => {
                    chars.next();
                    tokens.push(Token::Cmp(CmpOp::Eq));
                }
                '!' => {
                    chars.next();
                    if chars.next() != Some('=') {
                        return None;
                    }
                    tokens.push(Token::Cmp(CmpOp::Neq));
                }
                '>' => {
                    chars.next();
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Token::Cmp(CmpOp::Ge));
                    } else {
                        tokens.push(Token::Cmp(CmpOp::Gt));
                    }
                }
                '<' => {
                    chars.next();
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Token::Cmp(CmpOp::Le));
                    } else {
                        tokens.push(Token::Cmp(CmpOp::Lt));
                    }
                }
                '"' | '\'' => {
                    let quote = c;
                    chars.next();
                    let mut literal = String::new();
                    loop {
                        match chars.next() {
                            Some(ch) if ch == quote => break,
                            Some('\\') => literal.push(chars.next()?),
                            Some(ch) => literal.push(ch),
                            None => return None,
                        }
                    }
                    tokens.push(Token::Str(literal));
                }
                c if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' => {
                    let mut word = String::new();
                    while let Some(&ch) = chars.peek() {
                        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                            word.push(ch);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(match word.as_str() {
                        "true" => Token::Bool(true),
                        "false" => Token::Bool(false),
                        _ => match word.parse::<f64>() {
                            Ok(num) => Token::Num(num),
                            Err(_) => Token::Ident(word),
                        },
                    });
                }
                _ => return None,
            }
        }

        Some(tokens)
    }

    struct Parser {
        tokens: Vec<Token>,
        position: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<&Token> {
            self.tokens.get(self.position)
        }

        fn next(&mut self) -> Option<Token> {
            let token = self.tokens.get(self.position).cloned();
            if token.is_some() {
                self.position += 1;
            }
            token
        }

        fn parse_or(&mut self, record: &Value) -> Option<bool> {
            let mut result = self.parse_and(record)?;
            while self.peek() == Some(&Token::Or) {
                self.next();
                let rhs = self.parse_and(record)?;
                result = result || rhs;
            }
            Some(result)
        }

        fn parse_and(&mut self, record: &Value) -> Option<bool> {
            let mut result = self.parse_primary(record)?;
            while self.peek() == Some(&Token::And) {
                self.next();
                let rhs = self.parse_primary(record)?;
                result = result && rhs;
            }
            Some(result)
        }

        fn parse_primary(&mut self, record: &Value) -> Option<bool> {
            match self.next()? {
                Token::LParen => {
                    let inner = self.parse_or(record)?;
                    if self.next()? != Token::RParen {
                        return None;
                    }
                    Some(inner)
                }
                Token::Ident(field) => {
                    let op = match self.next()? {
                        Token::Cmp(op) => op,
                        _ => return None,
                    };
                    let literal = self.next()?;
                    Some(compare(lookup(record, &field), op, &literal))
                }
                _ => None,
            }
        }
    }

    fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = record;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    fn compare(field: Option<&Value>, op: CmpOp, literal: &Token) -> bool {
        match literal {
            Token::Str(expected) => {
                let actual = field.and_then(Value::as_str).unwrap_or("");
                match op {
                    CmpOp::Eq => actual == expected,
                    CmpOp::Neq => actual != expected,
                    CmpOp::Ge => actual >= expected.as_str(),
                    CmpOp::Gt => actual > expected.as_str(),
                    CmpOp::Le => actual <= expected.as_str(),
                    CmpOp::Lt => actual < expected.as_str(),
                }
            }
            Token::Bool(expected) => {
                let actual = field.and_then(Value::as_bool).unwrap_or(false);
                match op {
                    CmpOp::Eq => actual == *expected,
                    CmpOp::Neq => actual != *expected,
                    _ => false,
                }
            }
            Token::Num(expected) => {
                let actual = match field.and_then(Value::as_f64) {
                    Some(actual) => actual,
                    None => return false,
                };
                match op {
                    CmpOp::Eq => actual == *expected,
                    CmpOp::Neq => actual != *expected,
                    CmpOp::Ge => actual >= *expected,
                    CmpOp::Gt => actual > *expected,
                    CmpOp::Le => actual <= *expected,
                    CmpOp::Lt => actual < *expected,
                }
            }
            _ => false,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_id_and_emits_event() {
        let store = MemoryStore::new();
        let mut subscription = store.subscribe("danusin_locations").await.unwrap();

        let created = store
            .create(
                "danusin_locations",
                json!({"danuser": "u1", "location": {"lon": 1.0, "lat": 2.0}, "isactive": true}),
            )
            .await
            .unwrap();
        let id = created.get("id").and_then(Value::as_str).unwrap();
        assert_eq!(id.len(), 15);

        let event = subscription.next_event().await.unwrap();
        assert_eq!(event.action, EventAction::Create);
        assert_eq!(event.record.get("id").and_then(Value::as_str), Some(id));
    }

    #[tokio::test]
    async fn update_merges_and_delete_removes() {
        let store = MemoryStore::new();
        let id = store.seed(
            "danusin_locations",
            json!({"danuser": "u1", "isactive": true}),
        );

        let updated = store
            .update("danusin_locations", &id, json!({"isactive": false}))
            .await
            .unwrap();
        assert_eq!(updated.get("isactive"), Some(&Value::Bool(false)));
        assert_eq!(
            updated.get("danuser").and_then(Value::as_str),
            Some("u1"),
            "merge keeps untouched fields"
        );

        store.delete("danusin_locations", &id).await.unwrap();
        assert!(store.record("danusin_locations", &id).is_none());

        let missing = store
            .update("danusin_locations", &id, json!({"isactive": true}))
            .await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn first_list_item_respects_insertion_order() {
        let store = MemoryStore::new();
        let first = store.seed("c", json!({"danuser": "u1", "isactive": true}));
        store.seed("c", json!({"danuser": "u1", "isactive": true}));

        let found = store
            .get_first_list_item("c", "danuser = \"u1\" && isactive = true")
            .await
            .unwrap();
        assert_eq!(found.get("id").and_then(Value::as_str), Some(first.as_str()));
    }

    #[tokio::test]
    async fn fault_injection_fires_once() {
        let store = MemoryStore::new();
        store.seed("c", json!({"id": "r1", "danuser": "u1"}));
        store.fail_next(
            "update",
            SyncError::Api {
                status: 500,
                message: "boom".into(),
            },
        );

        let failed = store.update("c", "r1", json!({"isactive": true})).await;
        assert!(matches!(failed, Err(SyncError::Api { status: 500, .. })));

        let retried = store.update("c", "r1", json!({"isactive": true})).await;
        assert!(retried.is_ok());
        assert_eq!(store.op_count("update"), 2);
    }

    #[tokio::test]
    async fn full_list_sorts_by_updated() {
        let store = MemoryStore::new();
        store.seed(
            "c",
            json!({"id": "b", "danuser": "u2", "updated": "2024-01-02 00:00:00.000Z"}),
        );
        store.seed(
            "c",
            json!({"id": "a", "danuser": "u1", "updated": "2024-01-01 00:00:00.000Z"}),
        );

        let options = ListOptions::default().sorted_by("updated");
        let items = store.get_full_list("c", &options).await.unwrap();
        let ids: Vec<&str> = items
            .iter()
            .map(|v| v.get("id").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
