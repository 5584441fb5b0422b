//! Shadow variables
//!
//! Data attached by replacement code to objects it did not allocate, keyed
//! by the owner's address and a numeric id. Lookups are lock-free under the
//! RCU domain; writers serialize on a spinlock and replace a whole bucket,
//! the old one being reclaimed after a grace period.
//!
//! Writers also drive reclamation: once enough retired buckets are queued
//! they wait for a grace period, so no shadow call may be made from inside a
//! read-side critical section of the same domain.
//!
//! The store only manages the association. The payload is shared through an
//! `Arc` and callers synchronize any mutation of it themselves.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use klp_core::kwarn;
use klp_core::spinlock::SpinLock;

use crate::rcu::{RcuCell, RcuDomain};

type Payload = Arc<dyn Any + Send + Sync>;

/// Retired buckets queued before a writer waits for a grace period
const RECLAIM_BATCH: usize = 64;

#[derive(Clone)]
struct ShadowEntry {
    owner: u64,
    id: u64,
    data: Payload,
}

impl ShadowEntry {
    #[inline]
    fn matches(&self, owner: u64, id: u64) -> bool {
        self.owner == owner && self.id == id
    }
}

/// Shadow store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowError {
    /// A variable with this owner and id is already attached
    DuplicateKey { owner: u64, id: u64 },

    /// The constructor refused the payload (its return code)
    Constructor(i32),
}

impl ShadowError {
    pub fn errno(&self) -> i32 {
        match self {
            ShadowError::DuplicateKey { .. } => -libc::EEXIST,
            ShadowError::Constructor(code) if *code < 0 => *code,
            ShadowError::Constructor(_) => -libc::EINVAL,
        }
    }
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowError::DuplicateKey { owner, id } => {
                write!(f, "duplicate shadow variable <{:#x}, {:#x}>", owner, id)
            }
            ShadowError::Constructor(code) => write!(f, "shadow constructor failed ({})", code),
        }
    }
}

impl std::error::Error for ShadowError {}

/// Concurrent `(owner, id) -> payload` table
pub struct ShadowStore {
    buckets: Box<[RcuCell<Vec<ShadowEntry>>]>,
    bits: u32,
    lock: SpinLock<()>,
    rcu: Arc<RcuDomain>,
}

impl ShadowStore {
    /// Table with `1 << bits` buckets
    pub fn new(rcu: &Arc<RcuDomain>, bits: u32) -> Self {
        let bits = bits.clamp(1, 20);
        let buckets = (0..1usize << bits)
            .map(|_| RcuCell::new(rcu, Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ShadowStore {
            buckets,
            bits,
            lock: SpinLock::new(()),
            rcu: Arc::clone(rcu),
        }
    }

    #[inline]
    fn bucket(&self, owner: u64) -> &RcuCell<Vec<ShadowEntry>> {
        // Multiplicative hash, top bits.
        let h = owner.wrapping_mul(0x61c8_8646_80b5_83eb) >> (64 - self.bits);
        &self.buckets[h as usize]
    }

    fn lookup(&self, owner: u64, id: u64) -> Option<Payload> {
        let guard = self.rcu.read_lock();
        self.bucket(owner)
            .read(&guard)
            .iter()
            .find(|e| e.matches(owner, id))
            .map(|e| Arc::clone(&e.data))
    }

    /// Shadow variable `<owner, id>` if attached with payload type `T`
    pub fn get<T: Any + Send + Sync>(&self, owner: u64, id: u64) -> Option<Arc<T>> {
        self.lookup(owner, id)?.downcast::<T>().ok()
    }

    /// Whether anything is attached as `<owner, id>`
    pub fn contains(&self, owner: u64, id: u64) -> bool {
        self.lookup(owner, id).is_some()
    }

    /// Attach `data` as `<owner, id>`
    pub fn attach<T: Any + Send + Sync>(&self, owner: u64, id: u64, data: T) -> Result<Arc<T>, ShadowError> {
        self.attach_with(owner, id, move || Ok(data))
    }

    /// Attach the value built by `ctor`
    ///
    /// The constructor runs with the writer lock held, after the duplicate
    /// check, so it sees no concurrent attach of the same key.
    pub fn attach_with<T, F>(&self, owner: u64, id: u64, ctor: F) -> Result<Arc<T>, ShadowError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, i32>,
    {
        let ret = {
            let _w = self.lock.lock();
            if self.lookup(owner, id).is_some() {
                kwarn!("Duplicate shadow variable <{:#x}, {:#x}>", owner, id);
                return Err(ShadowError::DuplicateKey { owner, id });
            }
            self.insert_locked(owner, id, ctor)
        };
        self.rcu.reclaim(RECLAIM_BATCH);
        ret
    }

    /// Existing `<owner, id>`, or `data` attached as it
    ///
    /// `None` when an existing payload has another type.
    pub fn get_or_attach<T: Any + Send + Sync>(&self, owner: u64, id: u64, data: T) -> Option<Arc<T>> {
        self.get_or_attach_with(owner, id, move || Ok(data)).ok().flatten()
    }

    /// Existing `<owner, id>`, or the value built by `ctor` attached as it
    ///
    /// `ctor` runs only when nothing is attached yet. `Ok(None)` when an
    /// existing payload has another type.
    pub fn get_or_attach_with<T, F>(&self, owner: u64, id: u64, ctor: F) -> Result<Option<Arc<T>>, ShadowError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, i32>,
    {
        if let Some(data) = self.lookup(owner, id) {
            return Ok(data.downcast::<T>().ok());
        }
        let ret = {
            let _w = self.lock.lock();
            // Lost the race to another writer.
            if let Some(data) = self.lookup(owner, id) {
                return Ok(data.downcast::<T>().ok());
            }
            self.insert_locked(owner, id, ctor).map(Some)
        };
        self.rcu.reclaim(RECLAIM_BATCH);
        ret
    }

    fn insert_locked<T, F>(&self, owner: u64, id: u64, ctor: F) -> Result<Arc<T>, ShadowError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, i32>,
    {
        let data = Arc::new(ctor().map_err(|code| {
            kwarn!(
                "Failed to construct shadow variable <{:#x}, {:#x}> ({})",
                owner,
                id,
                code
            );
            ShadowError::Constructor(code)
        })?);
        let entry = ShadowEntry {
            owner,
            id,
            data: Arc::clone(&data) as Payload,
        };
        self.bucket(owner).update(|old| {
            let mut next = old.clone();
            next.push(entry);
            next
        });
        Ok(data)
    }

    /// Detach `<owner, id>`; false if it was not attached
    pub fn detach(&self, owner: u64, id: u64) -> bool {
        self.detach_with(owner, id, |_| {})
    }

    /// Detach `<owner, id>`, handing the payload to `dtor` first
    pub fn detach_with<F>(&self, owner: u64, id: u64, dtor: F) -> bool
    where
        F: FnOnce(&(dyn Any + Send + Sync)),
    {
        {
            let _w = self.lock.lock();
            let Some(data) = self.lookup(owner, id) else {
                return false;
            };
            dtor(&*data);
            self.bucket(owner).update(|old| {
                old.iter()
                    .filter(|e| !e.matches(owner, id))
                    .cloned()
                    .collect()
            });
        }
        self.rcu.reclaim(RECLAIM_BATCH);
        true
    }

    /// Detach every variable with `id`, returning how many were attached
    pub fn detach_all(&self, id: u64) -> usize {
        self.detach_all_with(id, |_, _| {})
    }

    /// Detach every variable with `id`, handing `(owner, payload)` to
    /// `dtor` first
    pub fn detach_all_with<F>(&self, id: u64, mut dtor: F) -> usize
    where
        F: FnMut(u64, &(dyn Any + Send + Sync)),
    {
        let w = self.lock.lock();
        let mut count = 0;
        for bucket in self.buckets.iter() {
            let hits: Vec<ShadowEntry> = {
                let guard = self.rcu.read_lock();
                bucket.read(&guard).iter().filter(|e| e.id == id).cloned().collect()
            };
            if hits.is_empty() {
                continue;
            }
            for e in &hits {
                dtor(e.owner, &*e.data);
            }
            count += hits.len();
            bucket.update(|old| old.iter().filter(|e| e.id != id).cloned().collect());
        }
        drop(w);
        self.rcu.reclaim(RECLAIM_BATCH);
        count
    }

    /// Number of attached variables
    pub fn len(&self) -> usize {
        let guard = self.rcu.read_lock();
        self.buckets.iter().map(|b| b.read(&guard).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ShadowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowStore")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .finish()
    }
}
