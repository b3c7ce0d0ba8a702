//! Request handler: maps protocol requests onto cache operations

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bookcache::{Cache, DeleteOutcome, SetOutcome};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::protocol::{Request, Response, Status};

/// Largest memory budget accepted on the command line or via `POST /memsize`
pub const MAX_MEMORY: u64 = (1 << 31) - 1;

#[derive(Serialize)]
struct KeyValue<'a> {
    key: Cow<'a, str>,
    value: Cow<'a, str>,
}

#[derive(Serialize)]
struct MemUsed {
    memused: usize,
}

#[derive(Serialize)]
struct StatsBody {
    entries: usize,
    memused: usize,
    maxmem: usize,
    table_capacity: usize,
    tombstones: usize,
    hits: u64,
    misses: u64,
    hit_ratio: f64,
    inserts: u64,
    updates: u64,
    rejections: u64,
    deletes: u64,
    evictions: u64,
    rebuilds: u64,
}

/// Per-daemon request handler; clones share the same cache
#[derive(Clone)]
pub struct CommandHandler {
    /// Swapped out wholesale by `POST /memsize`
    cache: Arc<RwLock<Cache>>,
    /// Set by the first stored `PUT`; locks the memory budget
    stored: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl CommandHandler {
    pub fn new(cache: Cache) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cache: Arc::new(RwLock::new(cache)),
            stored: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Receiver that flips to `true` once `POST /shutdown` is handled
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Get(key) => self.handle_get(&key),
            Request::Head(key) => self.handle_head(&key),
            Request::Put(key, value) => self.handle_put(&key, &value),
            Request::Delete(key) => self.handle_delete(&key),
            Request::MemSize => self.handle_memsize(),
            Request::SetMemSize(amount) => self.handle_set_memsize(amount),
            Request::Stats => self.handle_stats(),
            Request::Shutdown => self.handle_shutdown(),
        }
    }

    fn handle_get(&self, key: &[u8]) -> Response {
        let cache = self.cache.read();
        // The value view borrows `cache`; drop it before the guard
        let response = match cache.get(key) {
            Some(value) => json(&KeyValue {
                key: String::from_utf8_lossy(key),
                value: String::from_utf8_lossy(&value),
            }),
            None => Response::empty(Status::NotFound),
        };
        response
    }

    fn handle_head(&self, key: &[u8]) -> Response {
        if self.cache.read().contains(key) {
            Response::empty(Status::Ok)
        } else {
            Response::empty(Status::NotFound)
        }
    }

    fn handle_put(&self, key: &[u8], value: &[u8]) -> Response {
        // Held across the flag update so a concurrent resize sees both or neither
        let cache = self.cache.read();
        let outcome = cache.set(key, value);
        if outcome.is_stored() {
            self.stored.store(true, Ordering::Release);
        }
        match outcome {
            SetOutcome::Inserted => Response::empty(Status::Created),
            SetOutcome::Updated => Response::empty(Status::Ok),
            SetOutcome::Rejected => {
                warn!(
                    "Rejected {} byte item (budget {} bytes)",
                    key.len() + value.len(),
                    cache.capacity()
                );
                Response::empty(Status::TooLarge)
            }
        }
    }

    fn handle_delete(&self, key: &[u8]) -> Response {
        match self.cache.read().delete(key) {
            DeleteOutcome::Deleted => Response::empty(Status::Ok),
            DeleteOutcome::NotFound => Response::empty(Status::NotFound),
        }
    }

    fn handle_memsize(&self) -> Response {
        json(&MemUsed {
            memused: self.cache.read().space_used(),
        })
    }

    fn handle_set_memsize(&self, amount: u64) -> Response {
        if amount == 0 || amount > MAX_MEMORY {
            return Response::empty(Status::NotAllowed);
        }
        let mut cache = self.cache.write();
        if self.stored.load(Ordering::Acquire) {
            return Response::empty(Status::NotAllowed);
        }
        // amount <= MAX_MEMORY, so it fits in usize on every supported target
        match Cache::new(amount as usize) {
            Ok(resized) => {
                *cache = resized;
                info!("Memory budget set to {} bytes", amount);
                Response::empty(Status::Ok)
            }
            Err(e) => {
                error!("Failed to resize cache: {}", e);
                Response::empty(Status::NotAllowed)
            }
        }
    }

    fn handle_stats(&self) -> Response {
        let cache = self.cache.read();
        let stats = cache.stats();
        let snapshot = stats.snapshot();
        json(&StatsBody {
            entries: cache.len(),
            memused: cache.space_used(),
            maxmem: cache.capacity(),
            table_capacity: cache.table_capacity(),
            tombstones: cache.tombstones(),
            hits: snapshot.hits,
            misses: snapshot.misses,
            hit_ratio: stats.hit_ratio(),
            inserts: snapshot.inserts,
            updates: snapshot.updates,
            rejections: snapshot.rejections,
            deletes: snapshot.deletes,
            evictions: snapshot.evictions,
            rebuilds: snapshot.rebuilds,
        })
    }

    fn handle_shutdown(&self) -> Response {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
        Response::empty(Status::Ok)
    }
}

fn json<T: Serialize>(body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::json(bytes),
        Err(e) => {
            error!("Failed to encode response body: {}", e);
            Response::empty(Status::BadRequest)
        }
    }
}
