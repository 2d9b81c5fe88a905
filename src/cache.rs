//! Byte-budget LRU cache for decompressed tiles

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

/// Key of a materialized tile: (attribute, tile position)
pub type TileKey = (usize, usize);

struct CacheInner {
    tiles: HashMap<TileKey, Arc<Vec<u8>>>,
    lru_order: VecDeque<TileKey>,
    current_bytes: usize,
}

/// Thread-safe LRU over decompressed tile buffers.
///
/// Eviction is by total byte size against a fixed budget. Entries are
/// `Arc`ed so a tile stays alive for a reader that fetched it even if it
/// is evicted concurrently.
pub struct TileCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
}

impl TileCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                tiles: HashMap::new(),
                lru_order: VecDeque::new(),
                current_bytes: 0,
            }),
            max_bytes,
        }
    }

    pub fn get(&self, key: &TileKey) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let tile = inner.tiles.get(key).cloned()?;
        if let Some(pos) = inner.lru_order.iter().position(|k| k == key) {
            inner.lru_order.remove(pos);
            inner.lru_order.push_back(*key);
        }
        Some(tile)
    }

    pub fn insert(&self, key: TileKey, data: Vec<u8>) -> Arc<Vec<u8>> {
        let data = Arc::new(data);
        let mut inner = self.inner.lock();
        if inner.tiles.contains_key(&key) {
            return data;
        }
        // Evict oldest entries until the new tile fits; a tile larger than
        // the whole budget is still admitted alone.
        while inner.current_bytes + data.len() > self.max_bytes {
            let Some(old) = inner.lru_order.pop_front() else {
                break;
            };
            if let Some(tile) = inner.tiles.remove(&old) {
                inner.current_bytes -= tile.len();
            }
        }
        inner.current_bytes += data.len();
        inner.tiles.insert(key, data.clone());
        inner.lru_order.push_back(key);
        data
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.tiles.clear();
        inner.lru_order.clear();
        inner.current_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = TileCache::new(1024);
        cache.insert((0, 0), vec![1, 2, 3]);
        assert_eq!(cache.get(&(0, 0)).unwrap().as_slice(), &[1, 2, 3]);
        assert!(cache.get(&(0, 1)).is_none());
    }

    #[test]
    fn test_byte_budget_eviction() {
        let cache = TileCache::new(450);
        cache.insert((0, 0), vec![0u8; 200]);
        cache.insert((0, 1), vec![0u8; 200]);
        // Touch (0, 0) so (0, 1) is the eviction candidate
        cache.get(&(0, 0));
        cache.insert((0, 2), vec![0u8; 200]);

        assert!(cache.get(&(0, 0)).is_some());
        assert!(cache.get(&(0, 1)).is_none());
        assert!(cache.get(&(0, 2)).is_some());
    }

    #[test]
    fn test_oversized_tile_admitted() {
        let cache = TileCache::new(10);
        cache.insert((0, 0), vec![0u8; 100]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear() {
        let cache = TileCache::new(1024);
        cache.insert((0, 0), vec![1]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
