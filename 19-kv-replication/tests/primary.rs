//! End-to-end tests for the primary coordinator running on Tokio.
//!
//! Time is paused so deadlines and retry ticks are deterministic: the
//! runtime jumps the clock forward whenever every task is idle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kv_replication::persistence::{FlakyPersistence, MemoryPersistence, Persistence};
use kv_replication::replicator::LocalCluster;
use kv_replication::runtime::{PrimaryHandle, SecondaryHandle, spawn_primary, spawn_secondary};
use kv_replication::{ClientReply, CoordinatorConfig, KvError, NodeId, Operation, PersistError};
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::{Instant, timeout};

fn config(timeout_ms: u64, tick_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig::new(
        Duration::from_millis(timeout_ms),
        Duration::from_millis(tick_ms),
    )
    .expect("valid config")
}

fn memory() -> impl FnMut() -> MemoryPersistence + Send {
    let durable = MemoryPersistence::new();
    move || durable.clone()
}

/// Fails the first few writes it sees, counted across restarts.
struct CrashesUntilRestarted {
    remaining_failures: Arc<std::sync::atomic::AtomicUsize>,
    inner: MemoryPersistence,
}

impl Persistence for CrashesUntilRestarted {
    fn persist(&mut self, key: &str, value: Option<&str>) -> Result<(), PersistError> {
        use std::sync::atomic::Ordering;
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PersistError {
                key: key.to_string(),
                reason: "crashed".to_string(),
            });
        }
        self.inner.persist(key, value)
    }
}

struct TestCluster {
    connector: LocalCluster,
    primary: PrimaryHandle,
}

impl TestCluster {
    fn spawn(config: CoordinatorConfig) -> Result<Self> {
        let connector = LocalCluster::new();
        let primary = spawn_primary(1, config, memory(), Arc::new(connector.clone()))?;
        Ok(Self { connector, primary })
    }

    fn add_secondary(&self, id: NodeId, config: CoordinatorConfig) -> Result<SecondaryHandle> {
        let secondary = spawn_secondary(id, config, memory())?;
        self.connector.register(id, secondary.link());
        Ok(secondary)
    }
}

#[tokio::test(start_paused = true)]
async fn insert_without_secondaries_is_acked_and_readable() -> Result<()> {
    let durable = MemoryPersistence::new();
    let backend = durable.clone();
    let primary = spawn_primary(
        1,
        config(1000, 100),
        move || backend.clone(),
        Arc::new(LocalCluster::new()),
    )?;

    let (reply_to, mut replies) = unbounded_channel();
    primary.submit(
        Operation::Insert {
            key: "a".into(),
            value: "1".into(),
            id: 1,
        },
        reply_to.clone(),
    )?;
    assert_eq!(replies.recv().await, Some(ClientReply::Ack { id: 1 }));
    assert_eq!(durable.get("a"), Some("1".to_string()));

    primary.submit(
        Operation::Get {
            key: "a".into(),
            id: 2,
        },
        reply_to,
    )?;
    assert_eq!(
        replies.recv().await,
        Some(ClientReply::GetResult {
            key: "a".into(),
            value: Some("1".into()),
            id: 2,
        })
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_secondary_fails_the_write_after_the_deadline() -> Result<()> {
    let cluster = TestCluster::spawn(config(500, 50))?;
    // Node 2 is a member but never registered, so nothing ever acks.
    cluster.primary.replica_set_changed([2])?;

    let started = Instant::now();
    let reply = cluster.primary.insert("a", "1").await?;
    assert!(matches!(reply, ClientReply::Failed { .. }));
    assert!(started.elapsed() >= Duration::from_millis(500));

    assert_eq!(cluster.primary.get("a").await?, Some("1".to_string()));

    let status = cluster.primary.status().await?;
    assert_eq!(status.pending_persist, 0);
    assert_eq!(status.pending_replication, 0);
    assert_eq!(status.live_timers, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn crashed_persistence_is_recovered_by_the_retry_tick() -> Result<()> {
    let remaining_failures = Arc::new(std::sync::atomic::AtomicUsize::new(3));
    let failures = Arc::clone(&remaining_failures);
    let durable = MemoryPersistence::new();
    let observer = durable.clone();
    let primary = spawn_primary(
        1,
        config(1000, 50),
        move || CrashesUntilRestarted {
            remaining_failures: Arc::clone(&failures),
            inner: durable.clone(),
        },
        Arc::new(LocalCluster::new()),
    )?;

    let reply = primary.insert("a", "1").await?;
    assert!(matches!(reply, ClientReply::Ack { .. }));
    assert_eq!(observer.get("a"), Some("1".to_string()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn flaky_persistence_on_every_node_still_acks() -> Result<()> {
    let config = config(5000, 20);
    let connector = LocalCluster::new();
    // Each restart needs a fresh seed, or a failed first draw would repeat forever.
    let seeded = |node: u64| {
        let durable = MemoryPersistence::new();
        let mut restarts = 0;
        move || {
            restarts += 1;
            FlakyPersistence::with_seed(durable.clone(), 0.5, node * 10_000 + restarts)
        }
    };
    let primary = spawn_primary(1, config, seeded(1), Arc::new(connector.clone()))?;
    let secondary = spawn_secondary(2, config, seeded(2))?;
    connector.register(2, secondary.link());
    primary.replica_set_changed([2])?;

    for i in 0..10 {
        let reply = primary.insert(format!("k{i}"), i.to_string()).await?;
        assert!(matches!(reply, ClientReply::Ack { .. }), "write {i}: {reply:?}");
    }
    assert_eq!(secondary.get("k9").await?, Some("9".to_string()));
    assert_eq!(secondary.status().await?.next_expected_seq, 10);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ack_means_every_secondary_has_the_write() -> Result<()> {
    let config = config(1000, 50);
    let cluster = TestCluster::spawn(config)?;
    let two = cluster.add_secondary(2, config)?;
    let three = cluster.add_secondary(3, config)?;
    cluster.primary.replica_set_changed([2, 3])?;

    assert!(matches!(
        cluster.primary.insert("a", "1").await?,
        ClientReply::Ack { .. }
    ));
    assert_eq!(two.get("a").await?, Some("1".to_string()));
    assert_eq!(three.get("a").await?, Some("1".to_string()));

    assert!(matches!(
        cluster.primary.remove("a").await?,
        ClientReply::Ack { .. }
    ));
    assert_eq!(two.get("a").await?, None);
    assert_eq!(three.get("a").await?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn removing_a_silent_secondary_releases_the_write() -> Result<()> {
    let config = config(10_000, 50);
    let cluster = TestCluster::spawn(config)?;
    cluster.add_secondary(2, config)?;
    cluster.primary.replica_set_changed([2, 3])?;

    let (reply_to, mut replies) = unbounded_channel();
    cluster.primary.submit(
        Operation::Insert {
            key: "a".into(),
            value: "1".into(),
            id: 7,
        },
        reply_to,
    )?;
    let stuck = timeout(Duration::from_secs(1), replies.recv()).await;
    assert!(stuck.is_err(), "write must wait for node 3");

    cluster.primary.replica_set_changed([2])?;
    let reply = timeout(Duration::from_millis(100), replies.recv()).await?;
    assert_eq!(reply, Some(ClientReply::Ack { id: 7 }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn joining_secondary_catches_up_to_current_state() -> Result<()> {
    let config = config(1000, 50);
    let cluster = TestCluster::spawn(config)?;
    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
        cluster.primary.insert(key, value).await?;
    }
    cluster.primary.remove("b").await?;

    let late = cluster.add_secondary(4, config)?;
    cluster.primary.replica_set_changed([4])?;

    let expected = cluster.primary.status().await?.store;
    timeout(Duration::from_secs(5), async {
        loop {
            let caught_up = late.status().await?.store == expected;
            let settled = cluster.primary.status().await?.pending_replication == 0;
            if caught_up && settled {
                return Ok::<_, KvError>(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await??;

    assert_eq!(cluster.primary.status().await?.replicas, vec![4]);
    assert_eq!(late.get("a").await?, Some("1".to_string()));
    assert_eq!(late.get("b").await?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_membership_notifications_keep_one_replicator() -> Result<()> {
    let config = config(1000, 50);
    let cluster = TestCluster::spawn(config)?;
    let two = cluster.add_secondary(2, config)?;
    for _ in 0..3 {
        cluster.primary.replica_set_changed([1, 2])?;
    }

    assert!(matches!(
        cluster.primary.insert("a", "1").await?,
        ClientReply::Ack { .. }
    ));
    // A second replicator would have sent a second seq-0 snapshot stream.
    assert_eq!(two.status().await?.next_expected_seq, 1);
    assert_eq!(cluster.primary.status().await?.replicas, vec![2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn clients_sharing_an_id_each_get_one_reply() -> Result<()> {
    let config = config(1000, 50);
    let cluster = TestCluster::spawn(config)?;
    let two = cluster.add_secondary(2, config)?;
    cluster.primary.replica_set_changed([2])?;

    let alice = cluster.primary.clone();
    let bob = cluster.primary.new_client();
    let (alice_tx, mut alice_rx) = unbounded_channel();
    let (bob_tx, mut bob_rx) = unbounded_channel();
    alice.submit(
        Operation::Insert {
            key: "a".into(),
            value: "1".into(),
            id: 1,
        },
        alice_tx,
    )?;
    bob.submit(
        Operation::Insert {
            key: "b".into(),
            value: "2".into(),
            id: 1,
        },
        bob_tx,
    )?;

    assert_eq!(alice_rx.recv().await, Some(ClientReply::Ack { id: 1 }));
    assert_eq!(bob_rx.recv().await, Some(ClientReply::Ack { id: 1 }));
    // The primary drops the reply senders once each operation is terminal.
    assert_eq!(alice_rx.recv().await, None);
    assert_eq!(bob_rx.recv().await, None);

    assert_eq!(two.get("a").await?, Some("1".to_string()));
    assert_eq!(two.get("b").await?, Some("2".to_string()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn acks_arriving_after_failure_change_nothing() -> Result<()> {
    let config = config(500, 50);
    let cluster = TestCluster::spawn(config)?;
    // Node 2 is a member but unreachable until after the deadline.
    cluster.primary.replica_set_changed([2])?;

    let alice = cluster.primary.clone();
    let bob = cluster.primary.new_client();
    let (alice_tx, mut alice_rx) = unbounded_channel();
    let (bob_tx, mut bob_rx) = unbounded_channel();
    for (client, key, reply_to) in [(&alice, "a", alice_tx.clone()), (&bob, "b", bob_tx)] {
        client.submit(
            Operation::Insert {
                key: key.into(),
                value: "1".into(),
                id: 1,
            },
            reply_to,
        )?;
    }
    assert_eq!(alice_rx.recv().await, Some(ClientReply::Failed { id: 1 }));
    assert_eq!(bob_rx.recv().await, Some(ClientReply::Failed { id: 1 }));

    // The replicator still holds both snapshots and delivers them once the
    // secondary shows up; the acks it reports back are for dead operations.
    let two = cluster.add_secondary(2, config)?;
    timeout(Duration::from_secs(5), async {
        while two.status().await?.next_expected_seq < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok::<_, KvError>(())
    })
    .await??;

    assert_eq!(bob_rx.recv().await, None);
    assert!(timeout(Duration::from_secs(1), alice_rx.recv()).await.is_err());
    let status = cluster.primary.status().await?;
    assert_eq!(status.pending_persist, 0);
    assert_eq!(status.pending_replication, 0);
    assert_eq!(status.live_timers, 0);

    // The id is free again and the retry goes through.
    alice.submit(
        Operation::Insert {
            key: "a".into(),
            value: "2".into(),
            id: 1,
        },
        alice_tx,
    )?;
    assert_eq!(alice_rx.recv().await, Some(ClientReply::Ack { id: 1 }));
    assert_eq!(two.get("a").await?, Some("2".to_string()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopped_primary_reports_an_error() -> Result<()> {
    let cluster = TestCluster::spawn(config(1000, 50))?;
    cluster.primary.shutdown()?;
    let result = cluster.primary.status().await;
    assert!(matches!(result, Err(KvError::CoordinatorStopped(1))));
    Ok(())
}
