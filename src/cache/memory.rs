use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use super::DescriptorCache;
use crate::oci::{BlobDescriptor, Digest};

struct Entry {
    descriptor: BlobDescriptor,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    // recency index: tick → digest key, oldest first
    recency: BTreeMap<u64, String>,
    memberships: HashMap<String, HashSet<String>>,
    clock: u64,
}

/// In-memory LRU descriptor cache bounded by entry count. Repository
/// membership rides along with the global entries: when the LRU evicts
/// a descriptor, its memberships go with it.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        MemoryCache {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }
}

impl Inner {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn insert(&mut self, descriptor: &BlobDescriptor, capacity: usize) {
        let key = descriptor.digest.to_string();
        self.clock += 1;
        let tick = self.clock;

        if let Some(previous) = self.entries.insert(
            key.clone(),
            Entry {
                descriptor: descriptor.clone(),
                tick,
            },
        ) {
            self.recency.remove(&previous.tick);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > capacity {
            let Some((&oldest_tick, _)) = self.recency.iter().next() else {
                break;
            };
            let Some(oldest_key) = self.recency.remove(&oldest_tick) else {
                break;
            };
            self.entries.remove(&oldest_key);
            for members in self.memberships.values_mut() {
                members.remove(&oldest_key);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
        for members in self.memberships.values_mut() {
            members.remove(key);
        }
    }
}

#[async_trait]
impl DescriptorCache for MemoryCache {
    async fn get(&self, digest: &Digest) -> Option<BlobDescriptor> {
        let key = digest.to_string();
        let mut inner = self.inner.lock().unwrap();
        let descriptor = inner.entries.get(&key)?.descriptor.clone();
        inner.touch(&key);
        Some(descriptor)
    }

    async fn put(&self, descriptor: &BlobDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(descriptor, self.capacity);
    }

    async fn get_scoped(&self, namespace: &str, digest: &Digest) -> Option<BlobDescriptor> {
        let key = digest.to_string();
        let mut inner = self.inner.lock().unwrap();
        if !inner
            .memberships
            .get(namespace)
            .is_some_and(|members| members.contains(&key))
        {
            return None;
        }

        let descriptor = inner.entries.get(&key)?.descriptor.clone();
        inner.touch(&key);
        Some(descriptor)
    }

    async fn put_scoped(&self, namespace: &str, descriptor: &BlobDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(descriptor, self.capacity);
        inner
            .memberships
            .entry(namespace.to_string())
            .or_default()
            .insert(descriptor.digest.to_string());
    }

    async fn evict(&self, digest: &Digest) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(&digest.to_string());
    }
}
