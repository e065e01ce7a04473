//! Queue persistence through the compare-and-swap store

use futures::future::join_all;
use ops_operator::controller::error::Error;
use ops_operator::controller::queue::{
    MemoryQueueStore, OpsQueue, QUEUE_CAPACITY, QueueMode, Removal, update_queue,
};
use ops_operator::crd::{OpsType, annotations};

use crate::common::*;

fn enqueue_fn(
    name: String,
    type_: OpsType,
    mode: QueueMode,
) -> impl FnMut(&mut OpsQueue) -> ops_operator::Result<bool> + Send {
    move |q| {
        q.enqueue(&name, type_, None, mode, false)
            .map(|r| r.in_queue)
            .map_err(|e| Error::fatal(e.to_string()))
    }
}

mod concurrent_writers {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_enqueues_all_land_and_one_is_admitted() {
        let store = MemoryQueueStore::new();
        let writers = (0..5).map(|i| {
            update_queue(
                &store,
                "default",
                "pg",
                enqueue_fn(format!("restart-{i}"), OpsType::Restart, QueueMode::ByCluster),
            )
        });
        let results: Vec<bool> = join_all(writers)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let queue = store.snapshot("default", "pg").await;
        assert_eq!(queue.len(), 5);
        assert_eq!(results.iter().filter(|waiting| !**waiting).count(), 1);
        assert_eq!(queue.waiting().count(), 4);
    }

    #[tokio::test]
    async fn test_other_clusters_are_independent() {
        let store = MemoryQueueStore::new();
        for cluster in ["pg", "redis"] {
            let waiting = update_queue(
                &store,
                "default",
                cluster,
                enqueue_fn("restart".into(), OpsType::Restart, QueueMode::ByCluster),
            )
            .await
            .unwrap();
            assert!(!waiting);
        }
        assert_eq!(store.snapshot("default", "pg").await.len(), 1);
        assert_eq!(store.snapshot("default", "redis").await.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_promotes_through_the_store() {
        let store = MemoryQueueStore::new();
        for name in ["first", "second"] {
            update_queue(
                &store,
                "default",
                "pg",
                enqueue_fn(name.into(), OpsType::HorizontalScaling, QueueMode::ByCluster),
            )
            .await
            .unwrap();
        }
        store.inject_conflicts(2);
        let out = update_queue(&store, "default", "pg", |q| Ok(q.dequeue("first", Removal::Succeed)))
            .await
            .unwrap();
        assert_eq!(out.promoted.as_deref(), Some("second"));
        let queue = store.snapshot("default", "pg").await;
        assert!(queue.get("first").is_none());
        assert_eq!(queue.waiting().count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_new_requests() {
        let store = MemoryQueueStore::new();
        for i in 0..QUEUE_CAPACITY {
            update_queue(
                &store,
                "default",
                "pg",
                enqueue_fn(format!("ve-{i}"), OpsType::VolumeExpansion, QueueMode::BySelf),
            )
            .await
            .unwrap();
        }
        let err = update_queue(
            &store,
            "default",
            "pg",
            enqueue_fn("one-too-many".into(), OpsType::VolumeExpansion, QueueMode::BySelf),
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.snapshot("default", "pg").await.len(), QUEUE_CAPACITY);
    }
}

mod annotation {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn test_queue_is_read_from_the_cluster_annotation() {
        let mut cluster = ClusterBuilder::new("pg", "default").component("db", 3).build();
        assert!(OpsQueue::from_cluster(&cluster).unwrap().is_empty());

        cluster.annotations_mut().insert(
            annotations::OPS_QUEUE.to_string(),
            r#"[{"name":"scale","type":"HorizontalScaling","toClusterPhase":"Updating","queueBySelf":false,"inQueue":false},
                {"name":"ve","type":"VolumeExpansion","queueBySelf":true,"inQueue":true}]"#
                .to_string(),
        );
        let queue = OpsQueue::from_cluster(&cluster).unwrap();
        assert_eq!(queue.len(), 2);
        let ve = queue.get("ve").unwrap();
        assert!(ve.queue_by_self && ve.in_queue);
        assert_eq!(queue.waiting().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["ve"]);
    }

    #[test]
    fn test_empty_queue_removes_the_annotation() {
        let mut queue = OpsQueue::default();
        queue
            .enqueue("a", OpsType::Restart, None, QueueMode::ByCluster, false)
            .unwrap();
        queue.dequeue("a", Removal::Succeed);
        assert_eq!(queue.to_annotation().unwrap(), None);
    }
}
