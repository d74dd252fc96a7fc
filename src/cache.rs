use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, warn};
use vex_ir::Address;

use crate::engine::{EngineContext, PagePerms};
use crate::taint::BlockTaintEntry;
use crate::{page_base, PAGE_SIZE};

/// A cached copy of one guest code page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCacheEntry {
    pub bytes: Vec<u8>,
    pub perms: PagePerms,
}

/// Cache of decoded guest code pages, keyed by page-aligned address.
/// Shared across engine instances through [registry].
#[derive(Default)]
pub struct PageCache {
    pages: BTreeMap<u64, PageCacheEntry>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the pages covering `[addr, addr + bytes.len())`. `addr` must
    /// be page-aligned and `bytes` a whole number of pages.
    ///
    /// Re-caching a page with identical bytes is a no-op; differing bytes
    /// are refused and leave the existing entry in place. Returns whether
    /// every covered page is cached with the supplied contents afterwards.
    pub fn cache_page(&mut self, addr: u64, bytes: &[u8], perms: PagePerms) -> bool {
        if page_base(addr) != addr || bytes.len() % PAGE_SIZE != 0 {
            warn!("refusing unaligned code page cache request at {addr:#x}");
            return false;
        }

        let mut all_cached = true;
        for (i, chunk) in bytes.chunks_exact(PAGE_SIZE).enumerate() {
            let page_addr = addr + (i * PAGE_SIZE) as u64;
            match self.pages.get(&page_addr) {
                Some(existing) if existing.bytes == chunk => {}
                Some(_) => {
                    warn!("conflicting contents for cached page {page_addr:#x}");
                    all_cached = false;
                }
                None => {
                    self.pages.insert(
                        page_addr,
                        PageCacheEntry {
                            bytes: chunk.to_vec(),
                            perms,
                        },
                    );
                }
            }
        }

        all_cached
    }

    /// Whether the page containing `addr` is cached.
    pub fn in_cache(&self, addr: u64) -> bool {
        self.pages.contains_key(&page_base(addr))
    }

    /// The cached entry for the page containing `addr`.
    pub fn entry(&self, addr: u64) -> Option<&PageCacheEntry> {
        self.pages.get(&page_base(addr))
    }

    /// Drop every cached page whose range intersects `[addr, addr + len)`.
    /// Returns the base addresses of the dropped pages.
    pub fn uncache_pages_touching_region(&mut self, addr: u64, len: u64) -> Vec<u64> {
        if len == 0 {
            return Vec::new();
        }

        let first = page_base(addr);
        let last = page_base(addr + len - 1);
        let dropped: Vec<u64> = self.pages.range(first..=last).map(|(&base, _)| base).collect();
        for base in &dropped {
            debug!("uncaching code page {base:#x}");
            self.pages.remove(base);
        }

        dropped
    }

    /// Drop everything. Idempotent.
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Project the cached bytes covering `[addr, addr + size)` into the
    /// engine's address space. Returns false when any covered page is not
    /// cached; in that case no partial projection is attempted.
    pub fn map_cache(&self, addr: u64, size: u64, ctx: &mut dyn EngineContext) -> bool {
        if size == 0 {
            return false;
        }

        let first = page_base(addr);
        let last = page_base(addr + size - 1);

        let mut page_addr = first;
        while page_addr <= last {
            if !self.pages.contains_key(&page_addr) {
                return false;
            }
            page_addr += PAGE_SIZE as u64;
        }

        let mut page_addr = first;
        while page_addr <= last {
            let entry = &self.pages[&page_addr];
            // Mapping can fail when the engine already has the page; the
            // write below is what must succeed.
            let _ = ctx.mem_map(page_addr, PAGE_SIZE, entry.perms);
            if ctx.mem_write(page_addr, &entry.bytes).is_err() {
                return false;
            }
            page_addr += PAGE_SIZE as u64;
        }

        true
    }
}

/// Memoized analyzer output per block start address. Owned by one engine
/// instance; purged whenever the bytes under a block may have changed.
#[derive(Default)]
pub struct BlockTaintCache {
    entries: HashMap<Address, Arc<BlockTaintEntry>>,
}

impl BlockTaintCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, block_addr: Address) -> Option<Arc<BlockTaintEntry>> {
        self.entries.get(&block_addr).cloned()
    }

    pub fn insert(&mut self, block_addr: Address, entry: BlockTaintEntry) -> Arc<BlockTaintEntry> {
        let entry = Arc::new(entry);
        self.entries.insert(block_addr, Arc::clone(&entry));
        entry
    }

    /// Evict entries for blocks starting inside any page that intersects
    /// `[addr, addr + len)`.
    pub fn evict_region(&mut self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }

        let first = page_base(addr);
        let last = page_base(addr + len - 1);
        self.entries
            .retain(|&block_addr, _| !(first..last + PAGE_SIZE as u64).contains(&block_addr));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-wide registry of page caches keyed by a caller-chosen cache key,
/// so engine instances sharing an analysis session share decoded pages.
///
/// Mutations of a shared cache must be serialized by the host; the mutex
/// around each cache enforces memory safety, not protocol ordering.
pub mod registry {
    use super::*;

    struct RegistryEntry {
        refs: usize,
        cache: Arc<Mutex<PageCache>>,
    }

    static REGISTRY: OnceLock<Mutex<HashMap<u64, RegistryEntry>>> = OnceLock::new();

    fn registry() -> &'static Mutex<HashMap<u64, RegistryEntry>> {
        REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
    }

    /// Get the shared page cache for `key`, creating it on first use.
    /// Every `acquire` must be paired with a [release].
    pub fn acquire(key: u64) -> Arc<Mutex<PageCache>> {
        let mut map = registry().lock().expect("cache registry poisoned");
        let entry = map.entry(key).or_insert_with(|| RegistryEntry {
            refs: 0,
            cache: Arc::new(Mutex::new(PageCache::new())),
        });
        entry.refs += 1;
        Arc::clone(&entry.cache)
    }

    /// Drop one reference to the cache for `key`; the cache is destroyed
    /// when the last reference goes away.
    pub fn release(key: u64) {
        let mut map = registry().lock().expect("cache registry poisoned");
        if let Some(entry) = map.get_mut(&key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(&key);
            }
        }
    }
}
