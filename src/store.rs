//! In-process document store implementing the hosted-database client
//! contract the chat components are written against.
//!
//! ```text
//! get / query ──► point reads, equality filters, ordered + limited scans
//! create      ──► create-if-absent (AlreadyExists on conflict)
//! write       ──► server-assigned id, sequence, created_at stamping
//! update      ──► shallow partial merge
//! transaction ──► optimistic read-modify-write with bounded retry
//! watch       ──► snapshot subscription: full result set on every change
//! ```
//!
//! Documents are schemaless `serde_json::Value` objects. Every mutation
//! bumps a per-document version and fans out a change notice; watch tasks
//! recompute their full snapshot on each notice, so subscribers always
//! receive a self-contained result set rather than deltas.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::now_millis;

/// Field stamped into every written document with a global write
/// sequence; breaks ordering ties between equal order-by values.
pub const SEQ_FIELD: &str = "_seq";
/// Field treated as a server-timestamp sentinel: a `null` value at write
/// time is replaced with the store's clock.
const CREATED_AT_FIELD: &str = "created_at";

/// Optimistic transaction retry budget before giving up with `Aborted`.
const TX_MAX_RETRIES: usize = 5;

/// Change notice sent to all collections (used when availability flips).
const ALL_COLLECTIONS: &str = "*";

/// Sort direction for `Query::order_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A structured query over one collection.
#[derive(Debug, Clone)]
pub struct Query {
    collection: String,
    filters: Vec<(String, Value)>,
    order_by: Option<(String, Direction)>,
    limit: Option<usize>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Keep only documents whose `field` equals `value`.
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// What a subscription observes: one document or a query's result set.
#[derive(Debug, Clone)]
pub enum WatchTarget {
    Doc { collection: String, id: String },
    Query(Query),
}

impl WatchTarget {
    pub fn doc(collection: impl Into<String>, id: impl Into<String>) -> Self {
        WatchTarget::Doc {
            collection: collection.into(),
            id: id.into(),
        }
    }

    fn collection(&self) -> &str {
        match self {
            WatchTarget::Doc { collection, .. } => collection,
            WatchTarget::Query(q) => &q.collection,
        }
    }
}

/// A full snapshot delivered to subscribers. Errors arrive in-band so a
/// subscription never silently stalls.
pub type Snapshot = Result<Vec<Value>, ErrorKind>;

/// Live snapshot subscription. Dropping it (or the returned receiver
/// going unused) cancels the underlying recompute task.
pub struct Watch {
    rx: watch::Receiver<Snapshot>,
    task: JoinHandle<()>,
}

impl Watch {
    /// The most recent snapshot.
    pub fn current(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot. Returns `false` once the store side
    /// has gone away.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct VersionedDoc {
    version: u64,
    data: Value,
}

type Collection = BTreeMap<String, VersionedDoc>;

struct Inner {
    collections: RwLock<HashMap<String, Collection>>,
    changes: broadcast::Sender<String>,
    seq: AtomicU64,
    versions: AtomicU64,
    unavailable: AtomicBool,
}

/// Handle to the document store. Cheap to clone; all clones share state.
/// Components receive one by constructor injection.
#[derive(Clone)]
pub struct DocStore {
    inner: Arc<Inner>,
}

impl Default for DocStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(HashMap::new()),
                changes,
                seq: AtomicU64::new(0),
                versions: AtomicU64::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Fault injection for tests: while set, every operation fails with
    /// `Unavailable` and open watches deliver an error snapshot.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        let _ = self.inner.changes.send(ALL_COLLECTIONS.to_string());
    }

    fn check_available(&self) -> Result<(), ErrorKind> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(ErrorKind::Unavailable)
        } else {
            Ok(())
        }
    }

    fn notify(&self, collection: &str) {
        let _ = self.inner.changes.send(collection.to_string());
    }

    /// Stamp server-assigned fields into a document about to be stored.
    fn stamp(&self, doc: &mut Value) {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert(SEQ_FIELD.to_string(), Value::from(seq));
            match obj.get(CREATED_AT_FIELD) {
                Some(Value::Null) | None => {
                    obj.insert(CREATED_AT_FIELD.to_string(), Value::from(now_millis()));
                }
                Some(_) => {}
            }
        }
    }

    fn next_version(&self) -> u64 {
        self.inner.versions.fetch_add(1, Ordering::SeqCst)
    }

    /// Point read.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, ErrorKind> {
        self.check_available()?;
        let collections = self.inner.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|d| d.data.clone()))
    }

    /// Create a document with a caller-supplied id. Fails with
    /// `AlreadyExists` if the id is taken — the compare-and-swap
    /// primitive idempotent room creation relies on.
    pub async fn create(&self, collection: &str, id: &str, mut doc: Value) -> Result<(), ErrorKind> {
        self.check_available()?;
        let mut collections = self.inner.collections.write().await;
        let col = collections.entry(collection.to_string()).or_default();
        if col.contains_key(id) {
            return Err(ErrorKind::AlreadyExists);
        }
        self.stamp(&mut doc);
        col.insert(
            id.to_string(),
            VersionedDoc {
                version: self.next_version(),
                data: doc,
            },
        );
        drop(collections);
        self.notify(collection);
        Ok(())
    }

    /// Append a document with a generated id. The id is also written
    /// into the document's `id` field when one isn't set.
    pub async fn write(&self, collection: &str, mut doc: Value) -> Result<String, ErrorKind> {
        self.check_available()?;
        let id = Uuid::new_v4().to_string();
        if let Some(obj) = doc.as_object_mut() {
            match obj.get("id") {
                Some(Value::String(s)) if !s.is_empty() => {}
                _ => {
                    obj.insert("id".to_string(), Value::from(id.clone()));
                }
            }
        }
        self.stamp(&mut doc);
        let mut collections = self.inner.collections.write().await;
        let col = collections.entry(collection.to_string()).or_default();
        col.insert(
            id.clone(),
            VersionedDoc {
                version: self.next_version(),
                data: doc,
            },
        );
        drop(collections);
        self.notify(collection);
        Ok(id)
    }

    /// Shallow-merge `partial` into an existing document.
    pub async fn update(&self, collection: &str, id: &str, partial: Value) -> Result<(), ErrorKind> {
        self.check_available()?;
        let mut collections = self.inner.collections.write().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or(ErrorKind::NotFound)?;
        let (Some(target), Some(fields)) = (doc.data.as_object_mut(), partial.as_object()) else {
            return Err(ErrorKind::InvalidArgument);
        };
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
        doc.version = self.inner.versions.fetch_add(1, Ordering::SeqCst);
        drop(collections);
        self.notify(collection);
        Ok(())
    }

    /// Optimistic read-modify-write on one document.
    ///
    /// `f` runs against a copy; the commit only lands if no other writer
    /// touched the document in between, otherwise the whole cycle
    /// retries. `NotFound` if the document vanished, `Aborted` once the
    /// retry budget is spent.
    pub async fn transaction<F>(&self, collection: &str, id: &str, mut f: F) -> Result<(), ErrorKind>
    where
        F: FnMut(&mut Value) -> Result<(), ErrorKind>,
    {
        for _ in 0..TX_MAX_RETRIES {
            self.check_available()?;

            let (mut data, read_version) = {
                let collections = self.inner.collections.read().await;
                let doc = collections
                    .get(collection)
                    .and_then(|c| c.get(id))
                    .ok_or(ErrorKind::NotFound)?;
                (doc.data.clone(), doc.version)
            };

            f(&mut data)?;

            let mut collections = self.inner.collections.write().await;
            let doc = collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(id))
                .ok_or(ErrorKind::NotFound)?;
            if doc.version != read_version {
                continue; // conflicting write landed, retry
            }
            doc.data = data;
            doc.version = self.inner.versions.fetch_add(1, Ordering::SeqCst);
            drop(collections);
            self.notify(collection);
            return Ok(());
        }
        Err(ErrorKind::Aborted)
    }

    /// Run a structured query.
    pub async fn query(&self, q: &Query) -> Result<Vec<Value>, ErrorKind> {
        self.check_available()?;
        let collections = self.inner.collections.read().await;
        Ok(Self::run_query(&collections, q))
    }

    fn run_query(collections: &HashMap<String, Collection>, q: &Query) -> Vec<Value> {
        let Some(col) = collections.get(&q.collection) else {
            return Vec::new();
        };
        let mut results: Vec<&Value> = col
            .values()
            .map(|d| &d.data)
            .filter(|doc| {
                q.filters
                    .iter()
                    .all(|(field, expected)| doc.get(field) == Some(expected))
            })
            .collect();

        if let Some((field, direction)) = &q.order_by {
            results.sort_by(|a, b| {
                let ord = cmp_field(a, b, field);
                // Equal order keys fall back to global write order.
                let ord = ord.then_with(|| seq_of(a).cmp(&seq_of(b)));
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        if let Some(limit) = q.limit {
            results.truncate(limit);
        }
        results.into_iter().cloned().collect()
    }

    async fn snapshot(&self, target: &WatchTarget) -> Snapshot {
        self.check_available()?;
        let collections = self.inner.collections.read().await;
        match target {
            WatchTarget::Doc { collection, id } => Ok(collections
                .get(collection)
                .and_then(|c| c.get(id))
                .map(|d| vec![d.data.clone()])
                .unwrap_or_default()),
            WatchTarget::Query(q) => Ok(Self::run_query(&collections, q)),
        }
    }

    /// Open a snapshot subscription: the initial full snapshot is
    /// available immediately, and every relevant change produces a fresh
    /// one. Dropping the returned `Watch` unsubscribes.
    pub async fn watch(&self, target: WatchTarget) -> Watch {
        // Subscribe before taking the initial snapshot: a broadcast
        // receiver only sees notices sent after `subscribe()`, so the
        // reverse order would let a write landing in between go
        // unnoticed until some later unrelated change.
        let mut changes = self.inner.changes.subscribe();
        let initial = self.snapshot(&target).await;
        let (tx, rx) = watch::channel(initial);
        let store = self.clone();

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(collection)
                        if collection == target.collection() || collection == ALL_COLLECTIONS =>
                    {
                        let snap = store.snapshot(&target).await;
                        if tx.send(snap).is_err() {
                            break; // subscriber gone
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("watch lagged by {skipped} notices, recomputing");
                        let snap = store.snapshot(&target).await;
                        if tx.send(snap).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Watch { rx, task }
    }
}

fn seq_of(doc: &Value) -> u64 {
    doc.get(SEQ_FIELD).and_then(Value::as_u64).unwrap_or(0)
}

fn cmp_field(a: &Value, b: &Value, field: &str) -> CmpOrdering {
    let (a, b) = (a.get(field), b.get(field));
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}
