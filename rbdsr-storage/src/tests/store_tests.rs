use crate::store::RepositoryStore;
use rbdsr_core::{CapacityStats, DeviceConfig, DriverKind, RepositoryRecord, Result};
use tempfile::TempDir;
use uuid::Uuid;

fn record(id: Uuid) -> RepositoryRecord {
    let device = DeviceConfig::parse_pairs(DriverKind::Rbd, ["pool=vms"]).unwrap();
    RepositoryRecord::new(id, device.pool, None)
}

#[tokio::test]
async fn test_store_save_load_remove() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RepositoryStore::new(dir.path().join("repositories"));
    let id = Uuid::new_v4();

    assert!(store.load(&id).await?.is_none());
    assert!(store.list().await?.is_empty());

    let mut saved = record(id);
    saved.update_stats(CapacityStats::new(100, 30, Some(100)));
    store.save(&saved).await?;

    let loaded = store.load(&id).await?.expect("record saved");
    assert_eq!(loaded, saved);
    assert_eq!(store.list().await?.len(), 1);

    // no temporary file is left behind
    let names: Vec<_> = std::fs::read_dir(dir.path().join("repositories"))?
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec![format!("{id}.json")]);

    store.remove(&id).await?;
    store.remove(&id).await?;
    assert!(store.load(&id).await?.is_none());

    Ok(())
}
