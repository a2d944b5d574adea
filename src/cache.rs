//! Per-tenant settings behind an injected cache.
//!
//! [`SettingsService`] reads through a [`SettingsCache`] to a
//! [`SettingsStore`]. The cache is a constructor argument, so tests and
//! single-shot CLI commands can pass [`NoopCache`] and every lookup hits
//! the store. Writes go through the service, which invalidates the entry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;

/// Tenant-level switches and retrieval overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    /// When false, inbound messages are recorded but the bot stays silent.
    pub bot_enabled: bool,
    pub context_budget: Option<usize>,
    pub result_limit: Option<usize>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            bot_enabled: true,
            context_budget: None,
            result_limit: None,
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_settings(&self, tenant_id: &str) -> Result<Option<TenantSettings>>;
    async fn save_settings(&self, tenant_id: &str, settings: &TenantSettings) -> Result<()>;
}

/// Cache of tenant settings.
pub trait SettingsCache: Send + Sync {
    fn get(&self, tenant_id: &str) -> Option<TenantSettings>;
    fn put(&self, tenant_id: &str, settings: TenantSettings);
    fn invalidate(&self, tenant_id: &str);
    fn clear(&self);
}

/// Cache that never holds anything.
pub struct NoopCache;

impl SettingsCache for NoopCache {
    fn get(&self, _tenant_id: &str) -> Option<TenantSettings> {
        None
    }
    fn put(&self, _tenant_id: &str, _settings: TenantSettings) {}
    fn invalidate(&self, _tenant_id: &str) {}
    fn clear(&self) {}
}

/// Bounded cache whose entries expire `ttl` after insertion.
pub struct TtlCache {
    inner: Cache<String, TenantSettings>,
}

impl TtlCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries.max(1) as u64)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    /// Live entry count after pending evictions have run.
    pub fn len(&self) -> usize {
        self.inner.run_pending_tasks();
        self.inner.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SettingsCache for TtlCache {
    fn get(&self, tenant_id: &str) -> Option<TenantSettings> {
        self.inner.get(tenant_id)
    }

    fn put(&self, tenant_id: &str, settings: TenantSettings) {
        self.inner.insert(tenant_id.to_string(), settings);
    }

    fn invalidate(&self, tenant_id: &str) {
        self.inner.invalidate(tenant_id);
    }

    fn clear(&self) {
        self.inner.invalidate_all();
    }
}

/// Build the cache selected by `[cache]`; `ttl_secs = 0` disables it.
pub fn cache_from_config(config: &CacheConfig) -> Arc<dyn SettingsCache> {
    if config.ttl_secs == 0 {
        Arc::new(NoopCache)
    } else {
        Arc::new(TtlCache::new(
            Duration::from_secs(config.ttl_secs),
            config.max_entries,
        ))
    }
}

/// Read-through access to tenant settings.
pub struct SettingsService {
    store: Arc<dyn SettingsStore>,
    cache: Arc<dyn SettingsCache>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingsStore>, cache: Arc<dyn SettingsCache>) -> Self {
        Self { store, cache }
    }

    /// Settings for a tenant; defaults when none are stored.
    pub async fn get(&self, tenant_id: &str) -> Result<TenantSettings> {
        if let Some(hit) = self.cache.get(tenant_id) {
            return Ok(hit);
        }
        let settings = self
            .store
            .load_settings(tenant_id)
            .await?
            .unwrap_or_default();
        self.cache.put(tenant_id, settings.clone());
        Ok(settings)
    }

    pub async fn update(&self, tenant_id: &str, settings: &TenantSettings) -> Result<()> {
        self.store.save_settings(tenant_id, settings).await?;
        self.cache.invalidate(tenant_id);
        tracing::info!(tenant = tenant_id, bot_enabled = settings.bot_enabled, "tenant settings updated");
        Ok(())
    }

    pub fn cache(&self) -> &Arc<dyn SettingsCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingStore {
        loads: AtomicUsize,
        saved: Mutex<HashMap<String, TenantSettings>>,
    }

    #[async_trait]
    impl SettingsStore for CountingStore {
        async fn load_settings(&self, tenant_id: &str) -> Result<Option<TenantSettings>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.saved.lock().unwrap().get(tenant_id).cloned())
        }
        async fn save_settings(&self, tenant_id: &str, settings: &TenantSettings) -> Result<()> {
            self.saved
                .lock()
                .unwrap()
                .insert(tenant_id.to_string(), settings.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ttl_cache_serves_repeat_lookups() {
        let store = Arc::new(CountingStore::default());
        let service = SettingsService::new(
            store.clone(),
            Arc::new(TtlCache::new(Duration::from_secs(60), 16)),
        );
        assert!(service.get("t1").await.unwrap().bot_enabled);
        service.get("t1").await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_invalidates() {
        let store = Arc::new(CountingStore::default());
        let service = SettingsService::new(
            store.clone(),
            Arc::new(TtlCache::new(Duration::from_secs(60), 16)),
        );
        service.get("t1").await.unwrap();
        let off = TenantSettings {
            bot_enabled: false,
            ..TenantSettings::default()
        };
        service.update("t1", &off).await.unwrap();
        assert!(!service.get("t1").await.unwrap().bot_enabled);
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_noop_cache_always_hits_store() {
        let store = Arc::new(CountingStore::default());
        let service = SettingsService::new(store.clone(), Arc::new(NoopCache));
        service.get("t1").await.unwrap();
        service.get("t1").await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ttl_expiry_and_bound() {
        let cache = TtlCache::new(Duration::from_millis(10), 4);
        cache.put("t1", TenantSettings::default());
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("t1").is_none());

        let cache = TtlCache::new(Duration::from_secs(60), 2);
        for tenant in ["a", "b", "c", "d", "e"] {
            cache.put(tenant, TenantSettings::default());
        }
        assert!(cache.len() <= 2);

        cache.put("f", TenantSettings::default());
        cache.invalidate("f");
        assert!(cache.get("f").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_config_selects_noop() {
        let cache = cache_from_config(&CacheConfig {
            ttl_secs: 0,
            max_entries: 10,
        });
        cache.put("t1", TenantSettings::default());
        assert!(cache.get("t1").is_none());
    }
}
