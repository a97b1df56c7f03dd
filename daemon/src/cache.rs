//! Resident model cache.
//!
//! Each model id maps to a slot that is initialised at most once, so
//! concurrent requests for a model that is still loading wait for the same
//! load instead of starting their own. The table lock is only held for short,
//! synchronous bookkeeping; loads run outside it, so different ids never wait
//! on each other.

use chrono::{DateTime, Utc};
use kiln_runtime_api::{LoadedModel, ModelLoader, RuntimeError};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

/// A loaded model plus its residency bookkeeping.
pub struct ModelHandle {
    id: String,
    model: Arc<dyn LoadedModel>,
    stop_strings: Vec<String>,
    expires_at: Mutex<Instant>,
    loaded_at: DateTime<Utc>,
    leases: AtomicUsize,
}

impl ModelHandle {
    fn new(id: &str, model: Arc<dyn LoadedModel>, expires_at: Instant) -> Self {
        Self {
            id: id.to_string(),
            stop_strings: model.stop_strings(),
            model,
            expires_at: Mutex::new(expires_at),
            loaded_at: Utc::now(),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &dyn LoadedModel {
        self.model.as_ref()
    }

    pub fn stop_strings(&self) -> &[String] {
        &self.stop_strings
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn expires_at(&self) -> Instant {
        *self.expires_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn extend(&self, ttl: Duration) {
        let mut expires_at = self.expires_at.lock().unwrap_or_else(PoisonError::into_inner);
        *expires_at = (*expires_at).max(deadline(Instant::now(), ttl));
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at() < now
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    /// Pin the handle for the duration of a generation.
    pub fn lease(self: &Arc<Self>) -> Lease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        Lease {
            handle: self.clone(),
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("stop_strings", &self.stop_strings)
            .field("loaded_at", &self.loaded_at)
            .field("leases", &self.active_leases())
            .finish()
    }
}

/// Keeps a handle from being evicted while it is alive.
#[derive(Debug)]
pub struct Lease {
    handle: Arc<ModelHandle>,
}

impl Deref for Lease {
    type Target = ModelHandle;

    fn deref(&self) -> &ModelHandle {
        &self.handle
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.handle.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Longest residency a keep-alive can buy; larger TTLs are clamped to it.
const MAX_RESIDENCY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_RESIDENCY)).unwrap_or(now)
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<Arc<ModelHandle>>,
}

/// A model listed by `/api/ps`.
#[derive(Debug, Clone)]
pub struct ResidentModel {
    pub id: String,
    pub loaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active_leases: usize,
}

pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    table: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            table: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the resident handle for `id`, loading it on a miss.
    ///
    /// Hits push the expiry out to at least `now + ttl`.
    pub async fn acquire(&self, id: &str, ttl: Duration) -> Result<Arc<ModelHandle>, RuntimeError> {
        loop {
            let slot = self
                .table()
                .entry(id.to_string())
                .or_default()
                .clone();

            let loaded = slot
                .cell
                .get_or_try_init(|| async {
                    tracing::info!("Loading model {}", id);
                    let started = Instant::now();
                    let model = self.loader.load(id).await?;
                    tracing::info!("Model {} loaded in {:?}", id, started.elapsed());
                    Ok::<_, RuntimeError>(Arc::new(ModelHandle::new(
                        id,
                        model,
                        deadline(Instant::now(), ttl),
                    )))
                })
                .await;

            let mut table = self.table();
            let current = table.get(id).is_some_and(|s| Arc::ptr_eq(s, &slot));

            match loaded {
                Ok(handle) if current => {
                    handle.extend(ttl);
                    return Ok(handle.clone());
                }
                // Unloaded or evicted between load and bookkeeping; start over.
                Ok(_) => continue,
                Err(e) => {
                    if current && slot.cell.get().is_none() {
                        table.remove(id);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Drop the handle for `id`. Returns whether one was resident.
    pub fn unload(&self, id: &str) -> bool {
        let removed = self.table().remove(id);
        let was_resident = removed.is_some_and(|slot| slot.cell.initialized());
        if was_resident {
            tracing::info!("Unloaded model {}", id);
        }
        was_resident
    }

    pub fn resident(&self) -> Vec<ResidentModel> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut models: Vec<ResidentModel> = self
            .table()
            .values()
            .filter_map(|slot| slot.cell.get())
            .map(|handle| {
                let remaining = handle.expires_at().saturating_duration_since(now);
                ResidentModel {
                    id: handle.id.clone(),
                    loaded_at: handle.loaded_at,
                    expires_at: chrono::Duration::from_std(remaining)
                        .ok()
                        .and_then(|remaining| wall_now.checked_add_signed(remaining))
                        .unwrap_or(wall_now),
                    active_leases: handle.active_leases(),
                }
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Evict every idle handle that expired before `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.expired_candidates(now)
            .into_iter()
            .filter(|id| self.evict_if_expired(id, now))
            .count()
    }

    fn expired_candidates(&self, now: Instant) -> Vec<String> {
        self.table()
            .iter()
            .filter_map(|(id, slot)| slot.cell.get().map(|handle| (id, handle)))
            .filter(|(_, handle)| handle.is_expired(now) && handle.active_leases() == 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Re-checks under the table lock, so an extension that landed after the
    /// scan keeps the handle.
    fn evict_if_expired(&self, id: &str, now: Instant) -> bool {
        let mut table = self.table();
        let evict = table
            .get(id)
            .and_then(|slot| slot.cell.get())
            .is_some_and(|handle| handle.is_expired(now) && handle.active_leases() == 0);
        if evict {
            table.remove(id);
            tracing::info!("Evicted expired model {}", id);
        }
        evict
    }

    /// Run [`ModelCache::sweep`] every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let evicted = cache.sweep();
                if evicted > 0 {
                    tracing::debug!("Sweep evicted {} model(s)", evicted);
                }
            }
        })
    }
}
