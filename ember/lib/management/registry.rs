use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{EmberError, EmberResult};

use super::{VmInfo, VmRecord};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The set of VMs the control plane currently manages, keyed by id.
#[derive(Debug, Default)]
pub struct VmRegistry {
    records: RwLock<HashMap<String, Arc<VmRecord>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `record`. Fails if its id is already present.
    pub async fn insert(&self, record: Arc<VmRecord>) -> EmberResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(record.get_id()) {
            return Err(EmberError::DuplicateVm(record.get_id().clone()));
        }

        tracing::debug!(vm_id = %record.get_id(), "registered vm");
        records.insert(record.get_id().clone(), record);
        Ok(())
    }

    /// Looks up a record.
    pub async fn get(&self, id: &str) -> EmberResult<Arc<VmRecord>> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EmberError::NotFound(id.to_string()))
    }

    /// Removes and returns a record.
    pub async fn remove(&self, id: &str) -> EmberResult<Arc<VmRecord>> {
        let record = self
            .records
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EmberError::NotFound(id.to_string()))?;

        tracing::debug!(vm_id = %id, "unregistered vm");
        Ok(record)
    }

    /// Views of every record, oldest first.
    pub async fn list(&self) -> Vec<VmInfo> {
        let mut infos: Vec<VmInfo> = self
            .records
            .read()
            .await
            .values()
            .map(|record| record.info())
            .collect();

        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Every record.
    pub async fn records(&self) -> Vec<Arc<VmRecord>> {
        self.records.read().await.values().cloned().collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, path::Path};

    use crate::{
        config::{EmberConfig, NetworkConfig},
        network::NetworkIdentity,
        rootfs::RootfsArtifact,
        vm::HypervisorConfig,
    };

    use super::*;

    fn record(id: &str, byte: u8) -> Arc<VmRecord> {
        let identity = NetworkIdentity::derive(&NetworkConfig::default(), byte);
        let config = HypervisorConfig::compose(
            id,
            &identity,
            Path::new("/srv/rootfs/a.ext4"),
            1,
            256,
            &EmberConfig::default(),
        );
        Arc::new(VmRecord::new(
            id,
            "a",
            "alpine",
            identity,
            RootfsArtifact::new("/srv/rootfs/a.ext4"),
            config,
        ))
    }

    #[tokio::test]
    async fn test_insert_get_remove() -> anyhow::Result<()> {
        let registry = VmRegistry::new();
        registry.insert(record("one", 4)).await?;
        registry.insert(record("two", 5)).await?;

        assert_eq!(registry.get("one").await?.get_identity().get_host_byte(), 4);
        assert_eq!(registry.list().await.len(), 2);

        let ids: Vec<String> = registry.list().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["one".to_string(), "two".to_string()]);

        registry.remove("one").await?;
        assert!(matches!(
            registry.get("one").await.unwrap_err(),
            EmberError::NotFound(_)
        ));
        assert!(matches!(
            registry.remove("one").await.unwrap_err(),
            EmberError::NotFound(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() -> anyhow::Result<()> {
        let registry = VmRegistry::new();
        registry.insert(record("same", 4)).await?;

        let err = registry.insert(record("same", 5)).await.unwrap_err();
        assert!(matches!(err, EmberError::DuplicateVm(id) if id == "same"));
        assert_eq!(registry.get("same").await?.get_identity().get_host_byte(), 4);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_list_is_consistent_under_concurrent_writes() -> anyhow::Result<()> {
        let registry = Arc::new(VmRegistry::new());
        registry.insert(record("anchor", 4)).await?;

        let writers = (0..8u8).map(|writer| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..50 {
                    let id = format!("w{}-{}", writer, i);
                    registry.insert(record(&id, 10 + writer)).await.unwrap();
                    registry.remove(&id).await.unwrap();
                }
            })
        });

        let readers = (0..4).map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..100 {
                    let infos = registry.list().await;
                    let ids: HashSet<&str> = infos.iter().map(|i| i.id.as_str()).collect();

                    assert_eq!(ids.len(), infos.len());
                    assert!(ids.contains("anchor"));
                    assert!(infos.len() <= 9, "{} records listed", infos.len());
                    assert!(infos
                        .windows(2)
                        .all(|pair| pair[0].created_at <= pair[1].created_at));
                    tokio::task::yield_now().await;
                }
            })
        });

        for handle in futures::future::join_all(writers.chain(readers)).await {
            handle?;
        }

        let ids: Vec<String> = registry.list().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["anchor".to_string()]);
        Ok(())
    }
}
