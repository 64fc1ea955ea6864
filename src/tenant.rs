use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Per-salon engines. Each salon gets its own Engine, journal, compactor and
/// (when configured) no-show sweeper. Salon = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    engine_config: EngineConfig,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, engine_config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            engine_config,
        }
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Get or lazily load the engine for a salon.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to load the same salon; the entry lock
        // makes sure only one engine (and one journal writer) exists.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let journal_path = self.data_dir.join(format!("{safe_name}.journal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(
            Some(journal_path),
            notify,
            self.engine_config.clone(),
        )?);

        if let Some(after) = self.engine_config.no_show_after_minutes {
            let sweeper_engine = engine.clone();
            tokio::spawn(async move {
                reaper::run_no_show_sweeper(sweeper_engine, after).await;
            });
        }
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, "salon loaded");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn manager(dir: &tempfile::TempDir) -> TenantManager {
        TenantManager::new(dir.path().to_path_buf(), 1000, EngineConfig::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(&dir);

        let eng_a = tm.get_or_create("salon_a").unwrap();
        let eng_b = tm.get_or_create("salon_b").unwrap();

        let rid = Ulid::new();
        // Same staff id in both salons, different hours.
        eng_a.create_resource(rid, None, nine_to_six()).await.unwrap();
        eng_b.create_resource(rid, None, WorkingHours::closed()).await.unwrap();

        let day = DateRange::day(date(3));
        assert!(eng_b.free_windows(rid, day).await.unwrap().is_empty());
        assert_eq!(eng_a.free_windows(rid, day).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(&dir);

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
        assert!(tm.is_empty());

        let _eng = tm.get_or_create("my_salon").unwrap();
        assert!(dir.path().join("my_salon.journal").exists());
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(&dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(&dir);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.path().join("evil.journal").exists());

        // Nothing left after sanitization
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(&dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(&dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn reload_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        let rid = Ulid::new();
        {
            let tm = manager(&dir);
            let engine = tm.get_or_create("grooming").unwrap();
            engine.create_resource(rid, Some("Ana".into()), nine_to_six()).await.unwrap();
        }
        let tm = manager(&dir);
        let engine = tm.get_or_create("grooming").unwrap();
        assert_eq!(engine.get_resource(rid).await.unwrap().name.as_deref(), Some("Ana"));
    }
}
