mod common;

use anyhow::Result;
use common::{create, kv_rows, kv_table, replica, start};
use rows::Transform;
use serde_json::Value;
use tempfile::tempdir;

#[test]
fn replicas_discover_new_tables() -> Result<()> {
    let dir = tempdir()?;
    let cluster = start(dir.path())?;
    replica(&cluster, 1)?.create_table(&kv_table("kv"))?;

    assert_eq!(replica(&cluster, 1)?.tables(), vec!["kv".to_string()]);
    let r2 = replica(&cluster, 2)?;
    assert!(r2.tables().is_empty());
    assert_eq!(r2.refresh_tables()?, 1);
    assert_eq!(r2.tables(), vec!["kv".to_string()]);
    assert_eq!(r2.refresh_tables()?, 0);
    Ok(())
}

#[test]
fn tables_attach_only_on_listed_replicas() -> Result<()> {
    let dir = tempdir()?;
    let cluster = start(dir.path())?;
    create(&cluster, &kv_table("pair").with_replicas(&["r1", "r2"]))?;

    assert!(replica(&cluster, 2)?.tables().contains(&"pair".to_string()));
    assert!(replica(&cluster, 3)?.tables().is_empty());
    assert!(replica(&cluster, 3)?.insert("pair", kv_rows(&[(1, 1)])).is_err());
    assert_eq!(replica(&cluster, 1)?.health("pair")?.active_replica_count, 2);
    Ok(())
}

#[test]
fn create_is_idempotent_for_the_same_definition() -> Result<()> {
    let dir = tempdir()?;
    let cluster = start(dir.path())?;
    create(&cluster, &kv_table("kv"))?;
    replica(&cluster, 2)?.create_table(&kv_table("kv"))?;

    let different = kv_table("kv").with_transform(Transform::Dedup { version: "v".into() });
    assert!(replica(&cluster, 3)?.create_table(&different).is_err());
    Ok(())
}

#[test]
fn alter_reaches_every_replica_through_the_log() -> Result<()> {
    let dir = tempdir()?;
    let cluster = start(dir.path())?;
    create(&cluster, &kv_table("kv"))?;

    let altered = kv_table("kv").with_transform(Transform::Sum {
        columns: vec!["v".into()],
    });
    replica(&cluster, 2)?.alter_table(&altered)?;
    cluster.sync_all()?;
    for r in cluster.replicas() {
        assert_eq!(*r.store("kv")?.def(), altered);
    }

    let renamed_key = kv_table("kv").with_sort_key(&["v"]);
    assert!(replica(&cluster, 1)?.alter_table(&renamed_key).is_err());
    Ok(())
}

#[test]
fn health_serialises_to_json() -> Result<()> {
    let dir = tempdir()?;
    let cluster = start(dir.path())?;
    create(&cluster, &kv_table("kv"))?;
    replica(&cluster, 1)?.insert("kv", kv_rows(&[(1, 1)]))?;
    cluster.sync_all()?;

    let health = replica(&cluster, 2)?.health("kv")?;
    let json = serde_json::to_value(&health)?;
    assert_eq!(json["table"], "kv");
    assert_eq!(json["replica"], "r2");
    assert_eq!(json["active_replica_count"], 3);
    assert_eq!(json["queue_state"], "idle");
    assert_eq!(json["last_applied_seq"], 1);
    assert_eq!(json["lag"], 0);
    assert_eq!(json["failed_entries"], Value::Array(Vec::new()));
    assert!(json["is_leader"].is_boolean());
    Ok(())
}

#[test]
fn stopped_replica_is_reported_inactive() -> Result<()> {
    let dir = tempdir()?;
    let mut cluster = start(dir.path())?;
    create(&cluster, &kv_table("kv"))?;
    cluster.stop(3)?;
    assert_eq!(replica(&cluster, 1)?.health("kv")?.active_replica_count, 2);
    cluster.restart(3)?;
    assert_eq!(replica(&cluster, 1)?.health("kv")?.active_replica_count, 3);
    Ok(())
}
