//! Integration tests for pool management and statistics requests.

mod common;

use std::collections::BTreeMap;

use bytes::Bytes;
use holo_objecter::objecter::{
    AdminRequest, ClusterStatfs, ObjecterConfig, ObjecterError, PoolOpKind, PoolOpReply, PoolStat,
    PoolStatReply, StatfsReply,
};

use common::{recorder, router, MapBuilder};

fn map(epoch: u64) -> holo_objecter::objecter::ClusterMap {
    MapBuilder::new(epoch)
        .nodes(&[1])
        .pool(1, "existing", &[1])
        .build()
}

#[tokio::test]
async fn pool_name_and_id_are_checked_locally() {
    let (objecter, transport) = router(ObjecterConfig::default());
    objecter.apply_map(map(3)).await;

    let (c, _) = recorder();
    assert_eq!(
        objecter.create_pool("existing", 0, c).await,
        Err(ObjecterError::PoolExists {
            name: "existing".to_string()
        })
    );
    let (c, _) = recorder();
    assert_eq!(
        objecter.delete_pool(42, c).await,
        Err(ObjecterError::PoolNotFound {
            pool: "42".to_string()
        })
    );
    let (c, _) = recorder();
    assert!(matches!(
        objecter.rename_pool(1, "existing", c).await,
        Err(ObjecterError::PoolExists { .. })
    ));
    let (c, _) = recorder();
    assert!(matches!(
        objecter.create_pool_snap(42, "snap", c).await,
        Err(ObjecterError::PoolNotFound { .. })
    ));
    assert!(transport.admin().is_empty());
    assert_eq!(objecter.stats().await.pool_ops, 0);
}

#[tokio::test]
async fn pool_op_completes_once_its_epoch_is_applied() {
    let (objecter, transport) = router(ObjecterConfig::default());
    objecter.apply_map(map(3)).await;

    let (c, log) = recorder();
    let tid = objecter.create_pool("fresh", 2, c).await.expect("create");
    assert_eq!(
        transport.admin(),
        vec![AdminRequest::Pool {
            tid,
            op: PoolOpKind::Create {
                name: "fresh".to_string(),
                crush_rule: 2
            }
        }]
    );

    objecter
        .handle_pool_op_reply(PoolOpReply {
            tid,
            result: 0,
            epoch: 5,
            data: Bytes::from_static(b"done"),
        })
        .await;
    assert!(log.lock().unwrap().is_empty(), "epoch 5 not applied yet");
    assert_eq!(transport.map_requests(), vec![4]);
    let stats = objecter.stats().await;
    assert_eq!((stats.pool_ops, stats.completed), (1, 0));
    assert!(objecter.is_active().await);

    objecter.apply_map(map(4)).await;
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(objecter.stats().await.pool_ops, 1);
    objecter.apply_map(map(5)).await;
    assert_eq!(*log.lock().unwrap(), vec![Ok(Bytes::from_static(b"done"))]);
    let stats = objecter.stats().await;
    assert_eq!((stats.pool_ops, stats.completed), (0, 1));
    assert!(!objecter.is_active().await);
}

#[tokio::test]
async fn pool_op_waiting_for_its_map_is_neither_resent_nor_expired() {
    let config = ObjecterConfig {
        admin_op_timeout_ms: Some(0),
        ..ObjecterConfig::default()
    };
    let (objecter, transport) = router(config);
    objecter.apply_map(map(3)).await;
    let (c, log) = recorder();
    let tid = objecter.create_pool("fresh", 0, c).await.expect("create");
    let reply = PoolOpReply {
        tid,
        result: 0,
        epoch: 4,
        data: Bytes::new(),
    };
    objecter.handle_pool_op_reply(reply.clone()).await;
    // A repeated reply does not complete it early.
    objecter.handle_pool_op_reply(reply).await;
    assert!(log.lock().unwrap().is_empty());

    objecter.handle_admin_reset().await;
    assert_eq!(transport.admin().len(), 1);
    assert!(objecter.tick().await.admin_timeouts.is_empty());

    objecter.apply_map(map(4)).await;
    assert_eq!(*log.lock().unwrap(), vec![Ok(Bytes::new())]);
}

#[tokio::test]
async fn pool_op_reply_for_a_known_epoch_completes_immediately() {
    let (objecter, _transport) = router(ObjecterConfig::default());
    objecter.apply_map(map(3)).await;
    let (c, log) = recorder();
    let tid = objecter.delete_pool(1, c).await.expect("delete");
    objecter
        .handle_pool_op_reply(PoolOpReply {
            tid,
            result: 0,
            epoch: 3,
            data: Bytes::new(),
        })
        .await;
    assert_eq!(*log.lock().unwrap(), vec![Ok(Bytes::new())]);
}

#[tokio::test]
async fn pool_op_error_is_reported() {
    let (objecter, _transport) = router(ObjecterConfig::default());
    objecter.apply_map(map(3)).await;
    let (c, log) = recorder();
    let tid = objecter.create_pool_snap(1, "s1", c).await.expect("snap");
    objecter
        .handle_pool_op_reply(PoolOpReply {
            tid,
            result: -17,
            epoch: 0,
            data: Bytes::new(),
        })
        .await;
    assert_eq!(*log.lock().unwrap(), vec![Err(ObjecterError::Remote { code: -17 })]);
}

#[tokio::test]
async fn stats_and_statfs_are_delivered() {
    let (objecter, _transport) = router(ObjecterConfig::default());
    objecter.apply_map(map(3)).await;

    let (c, stat_log) = recorder();
    let stat_tid = objecter
        .get_pool_stats(vec!["existing".to_string()], c)
        .await
        .expect("pool stats");
    let (c, fs_log) = recorder();
    let fs_tid = objecter.get_fs_stats(c).await.expect("statfs");
    assert!(fs_tid > stat_tid);

    let mut stats = BTreeMap::new();
    stats.insert(
        "existing".to_string(),
        PoolStat {
            num_objects: 3,
            num_bytes: 300,
            ..PoolStat::default()
        },
    );
    objecter
        .handle_pool_stat_reply(PoolStatReply {
            tid: stat_tid,
            stats: stats.clone(),
        })
        .await;
    let fs = ClusterStatfs {
        kb: 100,
        kb_used: 1,
        kb_avail: 99,
        num_objects: 3,
    };
    objecter
        .handle_statfs_reply(StatfsReply {
            tid: fs_tid,
            stats: fs,
        })
        .await;
    // Duplicate replies are ignored.
    objecter
        .handle_statfs_reply(StatfsReply {
            tid: fs_tid,
            stats: fs,
        })
        .await;

    assert_eq!(*stat_log.lock().unwrap(), vec![Ok(stats)]);
    assert_eq!(*fs_log.lock().unwrap(), vec![Ok(fs)]);
    assert!(!objecter.is_active().await);
}

#[tokio::test]
async fn admin_requests_time_out_on_tick() {
    let config = ObjecterConfig {
        admin_op_timeout_ms: Some(0),
        ..ObjecterConfig::default()
    };
    let (objecter, _transport) = router(config);
    objecter.apply_map(map(3)).await;
    let (c, log) = recorder();
    let tid = objecter.get_fs_stats(c).await.expect("statfs");

    let report = objecter.tick().await;
    assert_eq!(report.admin_timeouts, vec![tid]);
    assert_eq!(*log.lock().unwrap(), vec![Err(ObjecterError::OpTimeout)]);
    assert_eq!(objecter.stats().await.statfs_ops, 0);
}

#[tokio::test]
async fn admin_reset_resends_everything_in_tid_order() {
    let (objecter, transport) = router(ObjecterConfig::default());
    objecter.apply_map(map(3)).await;
    let (c, _) = recorder();
    objecter.get_fs_stats(c).await.expect("statfs");
    let (c, _) = recorder();
    objecter.create_pool("fresh", 0, c).await.expect("create");
    let (c, _) = recorder();
    objecter.get_pool_stats(Vec::new(), c).await.expect("stats");
    let first_round = transport.admin();
    assert_eq!(first_round.len(), 3);

    objecter.handle_admin_reset().await;
    let all = transport.admin();
    assert_eq!(all.len(), 6);
    let resent: Vec<u64> = all[3..].iter().map(AdminRequest::tid).collect();
    let original: Vec<u64> = first_round.iter().map(AdminRequest::tid).collect();
    assert_eq!(resent, original);
    assert!(resent.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn shutdown_fails_admin_requests() {
    let (objecter, _transport) = router(ObjecterConfig::default());
    objecter.apply_map(map(3)).await;
    let (c, log) = recorder();
    objecter.create_pool("fresh", 0, c).await.expect("create");
    objecter.shutdown().await;
    assert_eq!(*log.lock().unwrap(), vec![Err(ObjecterError::Shutdown)]);
    let (c, _) = recorder();
    assert_eq!(objecter.get_fs_stats(c).await, Err(ObjecterError::Shutdown));
}
