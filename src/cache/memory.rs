// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache backend (`REDIS_URL=memory://`).

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::{CacheError, CacheStore};

pub struct MemoryCache {
    data: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().1 > now).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let hit = self.data.get(key).and_then(|e| (e.value().1 > now).then(|| e.value().0.clone()));
        if hit.is_none() {
            self.data.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.data.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.data.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let before = self.data.len();
        self.data.retain(|key, _| !glob_match(pattern, key));
        Ok(before.saturating_sub(self.data.len()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-style glob with `*` and `?`.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ki));
            pi += 1;
        } else if let Some((sp, sk)) = star {
            pi = sp + 1;
            ki = sk + 1;
            star = Some((sp, sk + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("patients:clinic:1*", "patients:clinic:1"));
        assert!(glob_match("patients:clinic:1*", "patients:clinic:1:q:ram:0:50"));
        assert!(glob_match("clinic:?", "clinic:7"));
        assert!(!glob_match("clinic:?", "clinic:17"));
        assert!(!glob_match("patients:clinic:1*", "patient:1"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));

        cache.delete("a").await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("short", "x", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_pattern_counts_removed() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("clinic:1", "a", ttl).await.unwrap();
        cache.set("clinic:1:stats", "b", ttl).await.unwrap();
        cache.set("clinic:2", "c", ttl).await.unwrap();

        assert_eq!(cache.delete_pattern("clinic:1*").await.unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        use std::sync::Arc;

        let cache = Arc::new(MemoryCache::new());
        let mut handles = vec![];
        for batch in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    cache.set(&format!("k:{batch}:{i}"), "v", Duration::from_secs(60)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cache.len(), 100);
    }
}
