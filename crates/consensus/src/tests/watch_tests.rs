use super::{put, test_config};
use crate::{ChangeKind, Command, ConsensusError, Coordination, LocalNetwork};
use anyhow::Result;
use config::ConsensusConfig;
use tempfile::tempdir;

#[test]
fn watch_sees_changes_under_prefix_in_order() -> Result<()> {
    let dir = tempdir()?;
    let net = LocalNetwork::start(dir.path(), 3, test_config())?;
    let h = net.handle(1);
    let mut watch = h.watch("/tables/", 0);

    h.propose(put("/tables/a", b"1"))?;
    h.propose(put("/other", b"x"))?;
    h.propose(Command::Delete {
        path: "/tables/a".into(),
    })?;
    net.settle()?;

    let seen: Vec<_> = watch
        .by_ref()
        .map(|c| c.map(|c| (c.path, c.kind)))
        .collect::<Result<_, _>>()?;
    assert_eq!(
        seen,
        vec![
            ("/tables/a".to_string(), ChangeKind::Created),
            ("/tables/a".to_string(), ChangeKind::Deleted),
        ]
    );
    Ok(())
}

#[test]
fn drained_watch_resumes_later() -> Result<()> {
    let dir = tempdir()?;
    let net = LocalNetwork::start(dir.path(), 3, test_config())?;
    let h = net.handle(2);
    let mut watch = h.watch("/w/", 0);
    assert!(watch.poll()?.is_empty());

    h.propose(put("/w/1", b""))?;
    net.settle()?;
    assert_eq!(watch.poll()?.len(), 1);
    assert!(watch.next().is_none());

    h.propose(put("/w/2", b""))?;
    net.settle()?;
    let next = watch.next().transpose()?.expect("change");
    assert_eq!(next.path, "/w/2");
    Ok(())
}

#[test]
fn restart_replays_from_revision() -> Result<()> {
    let dir = tempdir()?;
    let net = LocalNetwork::start(dir.path(), 3, test_config())?;
    let h = net.handle(1);
    let mut watch = h.watch("/r/", 0);
    h.propose(put("/r/1", b""))?;
    h.propose(put("/r/2", b""))?;
    net.settle()?;
    let all = watch.poll()?;
    assert_eq!(all.len(), 2);

    watch.restart(all[0].revision);
    let again = watch.poll()?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].path, "/r/2");
    Ok(())
}

#[test]
fn compacted_revision_is_an_error() -> Result<()> {
    let dir = tempdir()?;
    let cfg = ConsensusConfig {
        retained_changes: 2,
        ..test_config()
    };
    let net = LocalNetwork::start(dir.path(), 3, cfg)?;
    let h = net.handle(1);
    for i in 0..5 {
        h.propose(put(&format!("/c/{}", i), b""))?;
    }
    net.settle()?;
    let mut watch = h.watch("/c/", 0);
    assert!(matches!(watch.poll(), Err(ConsensusError::Compacted { .. })));
    Ok(())
}
