use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::OnceCell;
use tracing::info;

use crate::clock::Clock;
use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::observability::TENANTS_ACTIVE;
use crate::policy::SlotPolicy;

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("invalid tenant name {0:?}: use 1-{MAX_TENANT_NAME_LEN} letters, digits, '_' or '-'")]
    InvalidName(String),
    #[error("too many tenants")]
    TooMany,
    #[error("tenant storage: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings shared by every tenant's engine.
#[derive(Clone)]
pub struct TenantOptions {
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub policy: SlotPolicy,
    pub clock: Arc<dyn Clock>,
}

/// Filled once the tenant's WAL has been replayed.
type EngineCell = Arc<OnceCell<Arc<Engine>>>;

/// Manages per-tenant engines. Each tenant (clinic) gets its own Engine, WAL
/// file and compactor; nothing is shared between tenants.
pub struct TenantManager {
    engines: DashMap<String, EngineCell>,
    /// Tenants loaded or loading, never above `MAX_TENANTS`.
    reserved: AtomicUsize,
    data_dir: PathBuf,
    options: TenantOptions,
}

/// Tenant names become file names, so only a safe alphabet is accepted.
pub fn valid_tenant_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TENANT_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, options: TenantOptions) -> Self {
        Self {
            engines: DashMap::new(),
            reserved: AtomicUsize::new(0),
            data_dir,
            options,
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Loaded engine only; never touches the disk.
    pub fn get(&self, tenant: &str) -> Option<Arc<Engine>> {
        self.engines.get(tenant).and_then(|cell| cell.get().cloned())
    }

    /// Get or lazily load the engine for `tenant`. Concurrent first requests
    /// share one replay, which runs on the blocking pool. A failed load is
    /// retried by the next request.
    pub async fn get_or_create(&self, tenant: &str) -> Result<Arc<Engine>, TenantError> {
        if let Some(engine) = self.get(tenant) {
            return Ok(engine);
        }
        if !valid_tenant_name(tenant) {
            return Err(TenantError::InvalidName(tenant.to_string()));
        }

        let cell = self.reserve(tenant)?;
        cell.get_or_try_init(|| self.load(tenant)).await.cloned()
    }

    /// The tenant's cell, claiming one of the `MAX_TENANTS` places if it is new.
    fn reserve(&self, tenant: &str) -> Result<EngineCell, TenantError> {
        match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                self.reserved
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < MAX_TENANTS).then_some(n + 1))
                    .map_err(|_| TenantError::TooMany)?;
                let cell = EngineCell::default();
                slot.insert(cell.clone());
                Ok(cell)
            }
        }
    }

    async fn load(&self, tenant: &str) -> Result<Arc<Engine>, TenantError> {
        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let clock = self.options.clock.clone();
        let policy = self.options.policy.clone();
        let engine = tokio::task::spawn_blocking(move || {
            Engine::new(wal_path, Arc::new(NotifyHub::new()), clock, policy)
        })
        .await
        .map_err(io::Error::other)??;

        let engine = Arc::new(engine);
        self.spawn_compactor(engine.clone());
        metrics::gauge!(TENANTS_ACTIVE).set(self.tenant_count() as f64);
        info!(tenant, "tenant loaded");
        Ok(engine)
    }

    fn spawn_compactor(&self, engine: Arc<Engine>) {
        let threshold = self.options.compact_threshold;
        let every = self.options.compact_interval;
        tokio::spawn(async move {
            compactor::run_compactor(engine, threshold, every).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::engine::{NewProvider, NewWindow};
    use crate::model::*;
    use chrono::NaiveDate;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(name: &str) -> (TenantManager, PathBuf) {
        let dir = test_data_dir(name);
        let options = TenantOptions {
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            policy: SlotPolicy::default(),
            clock: Arc::new(FixedClock::at(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), 8, 0)),
        };
        (TenantManager::new(dir.clone(), options), dir)
    }

    async fn register(engine: &Engine, id: Ulid) {
        engine
            .register_provider(NewProvider {
                id,
                kind: ProviderKind::Doctor,
                name: None,
                chapter: None,
                buffer_after: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let (tm, _) = manager("isolation");
        let clinic_a = tm.get_or_create("clinic_a").await.unwrap();
        let clinic_b = tm.get_or_create("clinic_b").await.unwrap();

        // Same provider id in both tenants.
        let pid = Ulid::new();
        register(&clinic_a, pid).await;
        register(&clinic_b, pid).await;

        clinic_a
            .add_window(NewWindow {
                id: Ulid::new(),
                provider_id: pid,
                day_of_week: 1,
                start_time: 540,
                end_time: 720,
            })
            .await
            .unwrap();

        let monday = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(clinic_b.free_spans(pid, monday).await.unwrap().is_empty());
        assert_eq!(
            clinic_a.free_spans(pid, monday).await.unwrap(),
            vec![Span::new(540, 720)]
        );
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let (tm, dir) = manager("lazy");
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        assert!(tm.get("my_clinic").is_none());

        let _engine = tm.get_or_create("my_clinic").await.unwrap();
        assert!(dir.join("my_clinic.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let (tm, _) = manager("same_engine");
        let first = tm.get_or_create("foo").await.unwrap();
        let second = tm.get_or_create("foo").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn tenant_names_validated() {
        let (tm, dir) = manager("names");
        for bad in ["", "../evil", "a/b", "white space", "ünï"] {
            assert!(
                matches!(tm.get_or_create(bad).await, Err(TenantError::InvalidName(_))),
                "{bad:?} accepted"
            );
        }
        let long = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        assert!(matches!(tm.get_or_create(&long).await, Err(TenantError::InvalidName(_))));

        let at_limit = "x".repeat(MAX_TENANT_NAME_LEN);
        assert!(tm.get_or_create(&at_limit).await.is_ok());
        assert!(tm.get_or_create("North-Side_2").await.is_ok());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn tenant_state_reloaded_from_disk() {
        let dir = test_data_dir("reload");
        let pid = Ulid::new();
        let options = || TenantOptions {
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            policy: SlotPolicy::default(),
            clock: Arc::new(FixedClock::at(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), 8, 0)),
        };
        {
            let tm = TenantManager::new(dir.clone(), options());
            register(&tm.get_or_create("clinic").await.unwrap(), pid).await;
        }
        let tm = TenantManager::new(dir, options());
        let engine = tm.get_or_create("clinic").await.unwrap();
        assert!(engine.get_provider(&pid).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_load() {
        let (tm, dir) = manager("concurrent_load");
        let tm = Arc::new(tm);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tm = tm.clone();
                tokio::spawn(async move { tm.get_or_create("busy").await.unwrap() })
            })
            .collect();

        let mut engines = Vec::new();
        for handle in handles {
            engines.push(handle.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(tm.tenant_count(), 1);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tenant_cap_holds_under_concurrent_creation() {
        let (tm, _) = manager("cap_race");
        tm.reserved.store(MAX_TENANTS - 1, Ordering::Release);
        let tm = Arc::new(tm);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tm = tm.clone();
                tokio::spawn(async move { tm.get_or_create(&format!("clinic_{i}")).await })
            })
            .collect();
        let mut loaded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => loaded += 1,
                Err(TenantError::TooMany) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(loaded, 1);
        assert_eq!(tm.tenant_count(), MAX_TENANTS);
    }
}
