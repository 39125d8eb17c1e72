//! Proposer and overwrite path integration tests: compare-and-swap wins,
//! losses, mode gating, and input validation.

mod common;

use common::{
    blob_for, build, config_v, manual_settings, proposer_storage_mode, storage_config, wait_until,
};
use strand_membership::{
    NodeDescriptor, NodesConfigUpdate, RoleSet, ShardId, StorageState,
};
use strand_ncm::{NcmError, OperationMode};

fn add_node_2() -> NodesConfigUpdate {
    NodesConfigUpdate::AddNode {
        node: 2,
        descriptor: NodeDescriptor::new("node-2", "10.9.0.2:4440", RoleSet::storage_only())
            .with_shard(0, StorageState::None),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proposer_applies_an_update_on_top_of_the_published_config() {
    let ncm = build(proposer_storage_mode(), 3, manual_settings());
    ncm.store.seed(blob_for(&config_v(7)));
    assert!(ncm.manager.init(config_v(7), true).await);

    let accepted = ncm.manager.update(add_node_2()).await.expect("update");
    assert_eq!(accepted.version(), 8);
    assert!(accepted.node(2).is_some());

    assert!(wait_until(|| {
        ncm.manager.get_config().is_some_and(|nc| nc.version() == 8)
    })
    .await);
    assert_eq!(ncm.store.current_version(), 8);
    for worker in 0..3 {
        assert_eq!(ncm.hook_log.versions_for(worker), vec![7, 8]);
    }
    assert_eq!(ncm.manager.stats().updates_requested, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_the_cas_reports_the_winner_and_catches_up() {
    let ncm = build(proposer_storage_mode(), 2, manual_settings());
    assert!(ncm.manager.init(config_v(7), true).await);
    // Let the startup poll settle before planting a competing version.
    assert!(wait_until(|| ncm.store.read_attempts() >= 1).await);

    // Someone else already moved the store to version 9 behind our back.
    ncm.store.seed(blob_for(&config_v(9)));

    let err = ncm.manager.update(add_node_2()).await.unwrap_err();
    let winner = match err {
        NcmError::VersionMismatch(Some(winner)) => winner,
        other => panic!("expected a version mismatch, got: {other}"),
    };
    assert_eq!(winner.version(), 9);

    // The losing proposal still teaches the manager about the winner.
    assert!(wait_until(|| {
        ncm.manager.get_config().is_some_and(|nc| nc.version() == 9)
    })
    .await);
    assert_eq!(ncm.store.current_version(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_updates_apply_left_to_right_with_one_version_bump() {
    let ncm = build(proposer_storage_mode(), 2, manual_settings());
    ncm.store.seed(blob_for(&config_v(7)));
    assert!(ncm.manager.init(config_v(7), true).await);

    let accepted = ncm
        .manager
        .update_batch(vec![
            add_node_2(),
            NodesConfigUpdate::TransitionShardState {
                shard: ShardId { node: 2, shard: 0 },
                target: StorageState::JoiningReadOnly,
            },
        ])
        .await
        .expect("batch");
    // Two applied elements, one externally visible version step.
    assert_eq!(accepted.version(), 8);
    assert_eq!(
        accepted.shard_state(ShardId { node: 2, shard: 0 }),
        Some(StorageState::JoiningReadOnly)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_updates_never_reach_the_store() {
    let ncm = build(proposer_storage_mode(), 2, manual_settings());
    ncm.store.seed(blob_for(&config_v(7)));
    assert!(ncm.manager.init(config_v(7), true).await);
    let writes_before = ncm.store.write_attempts();

    let err = ncm
        .manager
        .update(NodesConfigUpdate::RemoveNode { node: 42 })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NcmError::FailedUpdate(strand_membership::MembershipError::UnknownNode(42))
    ));
    assert_eq!(ncm.store.write_attempts(), writes_before);
    assert_eq!(ncm.manager.get_config().expect("local").version(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_proposers_are_refused_without_store_contact() {
    let ncm = build(
        OperationMode::for_roles(&RoleSet::storage_only()),
        2,
        manual_settings(),
    );
    assert!(ncm.manager.init(config_v(7), true).await);

    let err = ncm.manager.update(add_node_2()).await.unwrap_err();
    assert!(matches!(err, NcmError::Access));
    assert_eq!(ncm.store.write_attempts(), 0);
    assert_eq!(ncm.manager.stats().updates_requested, 0);

    // Observers become proposers only through an explicit upgrade.
    ncm.manager.upgrade_to_proposer();
    assert!(wait_until(|| ncm.store.read_attempts() >= 1).await);
    ncm.store.seed(blob_for(&config_v(7)));
    let accepted = ncm.manager.update(add_node_2()).await.expect("update");
    assert_eq!(accepted.version(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_mode_cannot_overwrite() {
    let ncm = build(OperationMode::for_client(), 2, manual_settings());
    assert!(ncm.manager.init(config_v(7), true).await);

    let err = ncm.manager.overwrite(config_v(42)).await.unwrap_err();
    assert!(matches!(err, NcmError::Access));
    assert_eq!(ncm.store.write_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tooling_overwrite_bypasses_the_version_check() {
    let ncm = build(OperationMode::for_tooling(), 2, manual_settings());
    ncm.store.seed(blob_for(&config_v(7)));
    assert!(ncm.manager.init(config_v(7), true).await);

    let written = ncm
        .manager
        .overwrite(storage_config(42, StorageState::ReadWrite))
        .await
        .expect("overwrite");
    assert_eq!(written.version(), 42);

    assert!(wait_until(|| {
        ncm.manager
            .get_config()
            .is_some_and(|nc| nc.version() == 42)
    })
    .await);
    assert_eq!(ncm.store.current_version(), 42);
    assert_eq!(ncm.manager.stats().overwrites_requested, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overwriting_with_an_empty_config_is_invalid() {
    let ncm = build(OperationMode::for_tooling(), 2, manual_settings());
    assert!(ncm.manager.init(config_v(7), true).await);

    let err = ncm
        .manager
        .overwrite(strand_membership::NodesConfiguration::shared_empty())
        .await
        .unwrap_err();
    assert!(matches!(err, NcmError::InvalidParam));

    let err = ncm.manager.update_batch(Vec::new()).await.unwrap_err();
    assert!(matches!(err, NcmError::InvalidParam));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_store_failures_surface_as_again() {
    let ncm = build(proposer_storage_mode(), 2, manual_settings());
    ncm.store.seed(blob_for(&config_v(7)));
    assert!(ncm.manager.init(config_v(7), true).await);

    ncm.store.fail_next_write();
    let err = ncm.manager.update(add_node_2()).await.unwrap_err();
    assert!(matches!(err, NcmError::Again(_)));

    // Not auto-retried: the store was contacted exactly once, and the
    // caller's retry succeeds.
    let accepted = ncm.manager.update(add_node_2()).await.expect("retry");
    assert_eq!(accepted.version(), 8);
}
