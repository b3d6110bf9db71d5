//! Integration tests for how the router reacts to new cluster maps.
//!
//! Maps are fed in by hand and the recording transport shows which requests
//! were (re)sent where.

mod common;

use holo_objecter::objecter::{
    MapFlags, ObjectLocator, ObjectOperation, ObjecterConfig, ObjecterError, OpFlags, OpReply,
    OpSpec, ReplyFlags,
};

use bytes::Bytes;
use common::{outcome_kinds, recorder, router, MapBuilder};

const POOL: u64 = 3;

fn write_spec(name: &str) -> OpSpec {
    let mut op = ObjectOperation::new();
    op.write_full(Bytes::from_static(b"payload"));
    OpSpec::mutate(name, ObjectLocator::new(POOL), op)
}

fn read_spec(name: &str) -> OpSpec {
    let mut op = ObjectOperation::new();
    op.read(0, 16);
    OpSpec::read(name, ObjectLocator::new(POOL), op)
}

#[tokio::test]
async fn op_follows_primary_and_fails_when_pool_is_deleted() {
    let (objecter, transport) = router(ObjecterConfig::default());
    let base = MapBuilder::new(4).nodes(&[1, 2, 3]);
    assert!(objecter.apply_map(base.clone().pool(POOL, "p", &[1, 2]).build()).await);

    let (on_commit, log) = recorder();
    let tid = objecter
        .submit(write_spec("obj").on_commit(on_commit))
        .await
        .expect("submit");
    assert_eq!(tid, 1);
    let (node, first) = transport.last_for(tid);
    assert_eq!((node, first.attempt, first.map_epoch), (1, 1, 4));

    // Same placement: nothing moves.
    let mut unchanged = base.clone().pool(POOL, "p", &[1, 2]).build();
    unchanged.epoch = 5;
    assert!(objecter.apply_map(unchanged).await);
    assert_eq!(transport.attempts_for(tid).len(), 1);
    let info = objecter.op_info(tid).await.expect("op still outstanding");
    assert_eq!(info.node, Some(1));
    assert_eq!(objecter.session_info(1).await.expect("session 1").ops, vec![tid]);

    // Primary moves to node 2.
    let mut moved = base.clone().pool(POOL, "p", &[2, 1]).build();
    moved.epoch = 6;
    assert!(objecter.apply_map(moved).await);
    let (node, resent) = transport.last_for(tid);
    assert_eq!((node, resent.attempt, resent.map_epoch), (2, 2, 6));
    assert!(objecter.session_info(1).await.expect("session 1").ops.is_empty());
    assert_eq!(objecter.session_info(2).await.expect("session 2").ops, vec![tid]);
    assert_eq!(objecter.stats().await.resends_map_change, 1);

    // Pool deleted.
    let mut deleted = base.build();
    deleted.epoch = 7;
    assert!(objecter.apply_map(deleted).await);
    assert!(objecter.op_info(tid).await.is_none());
    assert_eq!(
        *log.lock().unwrap(),
        vec![Err(ObjecterError::TargetPoolRemoved { pool: POOL })]
    );
    let stats = objecter.stats().await;
    assert_eq!((stats.ops, stats.inflight_ops, stats.inflight_bytes), (0, 0, 0));
}

#[tokio::test]
async fn stale_and_repeated_maps_are_ignored() {
    let (objecter, transport) = router(ObjecterConfig::default());
    let map = MapBuilder::new(10).nodes(&[1]).pool(POOL, "p", &[1]).build();
    assert!(objecter.apply_map(map.clone()).await);
    objecter.submit(read_spec("a")).await.expect("submit");

    assert!(!objecter.apply_map(map.clone()).await, "same epoch twice");
    let mut older = map.clone();
    older.epoch = 9;
    older.pools.clear();
    assert!(!objecter.apply_map(older).await, "older epoch");

    assert_eq!(objecter.current_map().await.epoch, 10);
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(objecter.stats().await.ops, 1);
}

#[tokio::test]
async fn skipped_epochs_resend_even_without_a_placement_change() {
    let (objecter, transport) = router(ObjecterConfig::default());
    let builder = MapBuilder::new(4).nodes(&[1, 2]).pool(POOL, "p", &[1, 2]);
    objecter.apply_map(builder.clone().build()).await;
    let tid = objecter.submit(read_spec("a")).await.expect("submit");

    let mut next = builder.clone().build();
    next.epoch = 5;
    objecter.apply_map(next).await;
    assert_eq!(transport.attempts_for(tid).len(), 1, "consecutive epoch, same target");

    let mut jump = builder.build();
    jump.epoch = 8;
    objecter.apply_map(jump).await;
    let (node, req) = transport.last_for(tid);
    assert_eq!((node, req.attempt, req.map_epoch), (1, 2, 8));
}

#[tokio::test]
async fn node_down_makes_ops_homeless_until_it_returns() {
    let (objecter, transport) = router(ObjecterConfig::default());
    let up = MapBuilder::new(4).nodes(&[1, 2]).pool(POOL, "p", &[1, 2]);
    objecter.apply_map(up.clone().build()).await;
    let (on_ack, log) = recorder();
    let tid = objecter
        .submit(read_spec("a").on_ack(on_ack))
        .await
        .expect("submit");

    objecter.apply_map(up.clone().down(1).build_at(5)).await;
    let info = objecter.op_info(tid).await.expect("op kept");
    assert_eq!(info.node, None);
    assert!(info.paused);
    assert!(objecter.session_info(1).await.is_none());
    assert!(transport.snapshot().disconnects.contains(&1));
    let stats = objecter.stats().await;
    assert_eq!((stats.homeless_ops, stats.sessions), (1, 0));

    let report = objecter.tick().await;
    assert_eq!(report.homeless_ops, 1);
    assert!(transport.map_requests().contains(&6));

    objecter.apply_map(up.build_at(6)).await;
    let (node, req) = transport.last_for(tid);
    assert_eq!((node, req.attempt), (1, 2));
    assert!(!objecter.op_info(tid).await.expect("op").paused);

    objecter.handle_reply(OpReply::ok(&req, ReplyFlags::ACK)).await;
    assert_eq!(outcome_kinds(&log).get("ok"), Some(&1));
    assert!(objecter.op_info(tid).await.is_none());
}

#[tokio::test]
async fn full_cluster_holds_writes_but_not_reads() {
    let (objecter, transport) = router(ObjecterConfig::default());
    let full = MapFlags {
        full: true,
        ..MapFlags::default()
    };
    let builder = MapBuilder::new(4).nodes(&[1]).pool(POOL, "p", &[1]);
    objecter.apply_map(builder.clone().flags(full).build()).await;

    let write = objecter.submit(write_spec("w")).await.expect("write");
    let read = objecter.submit(read_spec("r")).await.expect("read");
    let forced = objecter
        .submit(write_spec("f").flags(OpFlags::FULL_FORCE))
        .await
        .expect("forced write");

    assert!(transport.attempts_for(write).is_empty());
    assert!(objecter.op_info(write).await.expect("write op").paused);
    assert_eq!(transport.attempts_for(read).len(), 1);
    assert_eq!(transport.attempts_for(forced).len(), 1);

    objecter.apply_map(builder.build_at(5)).await;
    let (node, req) = transport.last_for(write);
    assert_eq!((node, req.attempt, req.map_epoch), (1, 1, 5));
    assert_eq!(objecter.stats().await.resends_map_change, 0, "first send is not a resend");
}

#[tokio::test]
async fn honor_full_can_be_disabled() {
    let config = ObjecterConfig {
        honor_full: false,
        ..ObjecterConfig::default()
    };
    let (objecter, transport) = router(config);
    let full = MapFlags {
        full: true,
        ..MapFlags::default()
    };
    objecter
        .apply_map(MapBuilder::new(2).nodes(&[1]).pool(POOL, "p", &[1]).flags(full).build())
        .await;
    let tid = objecter.submit(write_spec("w")).await.expect("write");
    assert_eq!(transport.attempts_for(tid).len(), 1);
}

#[tokio::test]
async fn pause_read_holds_only_reads() {
    let (objecter, transport) = router(ObjecterConfig::default());
    let paused = MapFlags {
        pause_read: true,
        ..MapFlags::default()
    };
    let builder = MapBuilder::new(2).nodes(&[1]).pool(POOL, "p", &[1]);
    objecter.apply_map(builder.clone().flags(paused).build()).await;
    let read = objecter.submit(read_spec("r")).await.expect("read");
    let write = objecter.submit(write_spec("w")).await.expect("write");
    assert!(transport.attempts_for(read).is_empty());
    assert_eq!(transport.attempts_for(write).len(), 1);

    objecter.apply_map(builder.build_at(3)).await;
    assert_eq!(transport.attempts_for(read).len(), 1);
}

#[tokio::test]
async fn address_change_reopens_the_session_and_resends() {
    let (objecter, transport) = router(ObjecterConfig::default());
    let builder = MapBuilder::new(2).nodes(&[1]).pool(POOL, "p", &[1]);
    objecter.apply_map(builder.clone().build()).await;
    let tid = objecter.submit(read_spec("a")).await.expect("submit");

    objecter
        .apply_map(builder.moved(1, "10.9.9.9:6800").build_at(3))
        .await;
    let (node, req) = transport.last_for(tid);
    assert_eq!((node, req.attempt), (1, 2));
    let session = objecter.session_info(1).await.expect("session");
    assert_eq!(session.addr, "10.9.9.9:6800");
    assert_eq!(session.incarnation, 1);
    assert!(transport
        .snapshot()
        .connects
        .contains(&(1, "10.9.9.9:6800".to_string())));
}

#[tokio::test]
async fn encoded_maps_are_validated() {
    let (objecter, _transport) = router(ObjecterConfig::default());
    let map = MapBuilder::new(3).nodes(&[1]).build();
    let payload = map.encode().expect("encode");

    let err = objecter
        .handle_map(4, &payload)
        .await
        .expect_err("epoch mismatch");
    assert!(format!("{err:#}").contains("epoch 3"));
    assert!(objecter.handle_map(3, b"{").await.is_err());
    assert_eq!(objecter.current_map().await.epoch, 0);

    assert!(objecter.handle_map(3, &payload).await.expect("valid map"));
    assert_eq!(objecter.current_map().await.epoch, 3);
}

#[tokio::test]
async fn waiting_for_an_epoch_requests_maps() {
    let (objecter, transport) = router(ObjecterConfig::default());
    objecter.apply_map(MapBuilder::new(2).build()).await;
    assert_eq!(objecter.wait_for_epoch(1).await, Ok(2), "already there");

    let waiter = {
        let objecter = objecter.clone();
        tokio::spawn(async move { objecter.wait_for_epoch(4).await })
    };
    while objecter.stats().await.map_waiters == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(transport.map_requests(), vec![3]);

    objecter.apply_map(MapBuilder::new(3).build()).await;
    assert!(!waiter.is_finished());
    objecter.apply_map(MapBuilder::new(5).build()).await;
    assert_eq!(waiter.await.expect("join"), Ok(5));
}
