use super::manager::{JournalBackend, JournalEntryManager};
use crate::api::jwt_expiration_ms;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntryManagerRef {
    pub journal_entry_uid: String,
    pub journal_entry_jwt: String,
}

struct CacheEntry {
    manager: JournalEntryManager,
    refs: usize,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// Hands out one manager per journal entry. Managers nobody holds a lease on
/// are kept around up to `max_stale`, least recently used going first;
/// evicted managers are disposed.
pub struct EntryManagerCache {
    backend: Arc<dyn JournalBackend>,
    max_stale: usize,
    state: Mutex<CacheState>,
}

impl EntryManagerCache {
    pub fn new(backend: Arc<dyn JournalBackend>, max_stale: usize) -> Arc<Self> {
        Arc::new(Self {
            backend,
            max_stale,
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn backend(&self) -> &Arc<dyn JournalBackend> {
        &self.backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the manager for the referenced entry, creating it on first use.
    /// When the cached manager holds a JWT that expires sooner than the one
    /// offered, it switches to the offered one.
    pub fn request(self: &Arc<Self>, r: JournalEntryManagerRef) -> EntryManagerLease {
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;
        let entry = state
            .entries
            .entry(r.journal_entry_uid.clone())
            .or_insert_with(|| {
                log::debug!("[entry] creating manager for {}", r.journal_entry_uid);
                CacheEntry {
                    manager: JournalEntryManager::new(
                        r.journal_entry_uid.clone(),
                        r.journal_entry_jwt.clone(),
                        self.backend.clone(),
                    ),
                    refs: 0,
                    last_used: tick,
                }
            });
        let held = jwt_expiration_ms(&entry.manager.journal_entry_jwt().borrow());
        let offered = jwt_expiration_ms(&r.journal_entry_jwt);
        if offered.unwrap_or(i64::MIN) > held.unwrap_or(i64::MIN) {
            entry.manager.offer_jwt(r.journal_entry_jwt.clone());
        }
        entry.refs += 1;
        entry.last_used = tick;
        EntryManagerLease {
            cache: self.clone(),
            manager: entry.manager.clone(),
        }
    }

    /// The cached manager, without taking a lease.
    pub fn peek(&self, journal_entry_uid: &str) -> Option<JournalEntryManager> {
        self.lock()
            .entries
            .get(journal_entry_uid)
            .map(|e| e.manager.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, journal_entry_uid: &str) {
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some(entry) = state.entries.get_mut(journal_entry_uid) {
            entry.refs = entry.refs.saturating_sub(1);
            entry.last_used = tick;
        }

        let mut stale: Vec<(u64, String)> = state
            .entries
            .iter()
            .filter(|(_, e)| e.refs == 0)
            .map(|(uid, e)| (e.last_used, uid.clone()))
            .collect();
        if stale.len() <= self.max_stale {
            return;
        }
        stale.sort();
        let excess = stale.len() - self.max_stale;
        for (_, uid) in stale.into_iter().take(excess) {
            if let Some(evicted) = state.entries.remove(&uid) {
                log::debug!("[entry] evicting manager for {}", uid);
                evicted.manager.dispose();
            }
        }
    }
}

/// Keeps a manager from going stale while held.
pub struct EntryManagerLease {
    cache: Arc<EntryManagerCache>,
    manager: JournalEntryManager,
}

impl EntryManagerLease {
    pub fn manager(&self) -> &JournalEntryManager {
        &self.manager
    }
}

impl std::ops::Deref for EntryManagerLease {
    type Target = JournalEntryManager;

    fn deref(&self) -> &JournalEntryManager {
        &self.manager
    }
}

impl Drop for EntryManagerLease {
    fn drop(&mut self) {
        self.cache.release(self.manager.journal_entry_uid());
    }
}
