use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, OverlapPolicy};
use crate::limits::*;

/// Manages per-tenant engines. Each tenant is an isolated marketplace with its
/// own Engine, WAL file and compactor task.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    overlap: OverlapPolicy,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, overlap: OverlapPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            overlap,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    ///
    /// Must be called from within a tokio runtime: a new engine spawns its
    /// WAL writer and compactor.
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

        // Only [A-Za-z0-9_-] reach the file name.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }
        // Two connections racing on a new tenant must not open the WAL twice.
        // The shard stays locked until the engine is inserted.
        let slot = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => slot,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.overlap)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        drop(slot.insert(engine.clone()));
        info!("tenant {tenant:?} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roost_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, OverlapPolicy::default())
    }

    fn guest_input(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            name: "Gus".into(),
            role: Role::Guest,
            phone: String::new(),
            address: String::new(),
            business_name: None,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same id and email in both tenants.
        let uid = Ulid::new();
        eng_a.register_user(uid, guest_input("gus@example.com")).await.unwrap();
        eng_b.register_user(uid, guest_input("gus@example.com")).await.unwrap();

        let oid = Ulid::new();
        eng_a
            .register_user(
                oid,
                NewUser {
                    role: Role::Owner,
                    business_name: Some("A Stays".into()),
                    ..guest_input("owner@example.com")
                },
            )
            .await
            .unwrap();
        let pid = Ulid::new();
        eng_a
            .create_property(
                pid,
                oid,
                NewProperty {
                    name: "Loft".into(),
                    description: String::new(),
                    location: "Lisbon".into(),
                    price: 90.0,
                    amenities: String::new(),
                    images: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(eng_a.list_properties(&PropertyFilter::default()).await.len(), 1);
        assert!(eng_b.list_properties(&PropertyFilter::default()).await.is_empty());
        assert!(eng_b.get_user(&oid).is_none());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_state_survives_reload() {
        let dir = test_data_dir("reload");
        let uid = Ulid::new();
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("stays").unwrap();
            eng.register_user(uid, guest_input("back@example.com")).await.unwrap();
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("stays").unwrap();
        assert_eq!(eng.get_user(&uid).unwrap().email, "back@example.com");
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
