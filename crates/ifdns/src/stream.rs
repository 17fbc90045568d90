use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque position in a stream: high 32 bits are a millisecond timestamp,
/// low 32 bits a per-stream append counter. Rendered as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor(pub u64);

impl Cursor {
    /// Sentinel selecting the start of a stream.
    pub const HEAD: Cursor = Cursor(0);
    /// Sentinel selecting the end of a stream.
    pub const TAIL: Cursor = Cursor(u64::MAX);
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = u64::from_str_radix(s, 16).map_err(|_| anyhow::anyhow!("invalid cursor '{s}'"))?;
        Ok(Cursor(value))
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e| D::Error::custom(format!("{e:#}")))
    }
}

/// Stream payloads learn their cursor when appended.
pub trait CursorAware {
    fn set_cursor(&mut self, cursor: Cursor);
}

/// Fixed-capacity buffer that drops the oldest entry on overflow.
/// Indexing is in insertion order.
pub struct RingBuf<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuf<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        RingBuf {
            buf: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.buf.get(i)
    }

    pub fn iter_from(&self, from: usize) -> impl Iterator<Item = &T> {
        self.buf.iter().skip(from)
    }

    pub fn iter_back_from(&self, from: usize) -> impl Iterator<Item = &T> {
        let end = (from + 1).min(self.buf.len());
        self.buf.iter().take(end).rev()
    }
}

pub type ListenerId = u64;

struct Entry<T> {
    cursor: Cursor,
    value: T,
}

struct StreamInner<T> {
    buf: RingBuf<Entry<T>>,
    counter: u32,
    listeners: HashMap<ListenerId, Box<dyn Fn(Cursor, &T) + Send + Sync>>,
    next_listener: ListenerId,
}

/// Page of stream entries. `has_more` is set iff a further matching entry
/// exists past the returned window.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult<T> {
    pub items: Vec<T>,
    pub first_cursor: Cursor,
    pub last_cursor: Cursor,
    pub has_more: bool,
}

/// Bounded in-memory history of events with monotonic cursors, paged queries
/// and synchronous fan-out to listeners.
pub struct BufferedStream<T> {
    inner: RwLock<StreamInner<T>>,
}

impl<T: CursorAware + Clone> BufferedStream<T> {
    pub fn new(capacity: usize) -> Self {
        BufferedStream {
            inner: RwLock::new(StreamInner {
                buf: RingBuf::with_capacity(capacity),
                counter: 0,
                listeners: HashMap::new(),
                next_listener: 0,
            }),
        }
    }

    /// Assigns a cursor, stores the event and invokes listeners, all under the
    /// write lock so listeners observe events in cursor order. Listener
    /// callbacks must not block.
    pub fn append(&self, mut value: T) {
        let mut inner = self.inner.write().expect("stream lock poisoned");
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let cursor = Cursor(millis << 32 | inner.counter as u64);
        inner.counter = inner.counter.wrapping_add(1);
        value.set_cursor(cursor);
        for listener in inner.listeners.values() {
            listener(cursor, &value);
        }
        inner.buf.push(Entry { cursor, value });
    }

    /// Walks forward from the first entry strictly after `cursor`, collecting
    /// up to `count` entries matching `predicate`.
    pub fn query(&self, cursor: Cursor, count: usize, predicate: Option<&dyn Fn(&T) -> bool>) -> QueryResult<T> {
        let inner = self.inner.read().expect("stream lock poisoned");
        let pos = inner.partition_point(|c| c <= cursor);
        collect_page(inner.buf.iter_from(pos), cursor, count, predicate)
    }

    /// Walks backward from the first entry strictly before `cursor`.
    pub fn query_backward(
        &self,
        cursor: Cursor,
        count: usize,
        predicate: Option<&dyn Fn(&T) -> bool>,
    ) -> QueryResult<T> {
        let inner = self.inner.read().expect("stream lock poisoned");
        let before = inner.partition_point(|c| c < cursor);
        if before == 0 {
            return QueryResult {
                items: Vec::new(),
                first_cursor: cursor,
                last_cursor: cursor,
                has_more: false,
            };
        }
        collect_page(inner.buf.iter_back_from(before - 1), cursor, count, predicate)
    }

    /// Registers a fan-out sink; deregister with [`BufferedStream::unlisten`].
    pub fn listen(&self, listener: impl Fn(Cursor, &T) + Send + Sync + 'static) -> ListenerId {
        let mut inner = self.inner.write().expect("stream lock poisoned");
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.insert(id, Box::new(listener));
        id
    }

    pub fn unlisten(&self, id: ListenerId) {
        let mut inner = self.inner.write().expect("stream lock poisoned");
        inner.listeners.remove(&id);
    }
}

impl<T> StreamInner<T> {
    /// Index of the first entry whose cursor fails `pred` (entries are cursor-sorted).
    fn partition_point(&self, pred: impl Fn(Cursor) -> bool) -> usize {
        let mut lo = 0;
        let mut hi = self.buf.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let entry = self.buf.get(mid).expect("mid is in range");
            if pred(entry.cursor) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

fn collect_page<'a, T: Clone + 'a>(
    entries: impl Iterator<Item = &'a Entry<T>>,
    cursor: Cursor,
    count: usize,
    predicate: Option<&dyn Fn(&T) -> bool>,
) -> QueryResult<T> {
    let mut res = QueryResult {
        items: Vec::new(),
        first_cursor: cursor,
        last_cursor: cursor,
        has_more: false,
    };
    for entry in entries {
        if let Some(predicate) = predicate {
            if !predicate(&entry.value) {
                continue;
            }
        }
        if res.items.len() >= count {
            res.has_more = true;
            break;
        }
        if res.items.is_empty() {
            res.first_cursor = entry.cursor;
        }
        res.last_cursor = entry.cursor;
        res.items.push(entry.value.clone());
    }
    res
}
