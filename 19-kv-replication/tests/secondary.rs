//! Snapshot ordering on a running secondary, driven directly through its link.

use std::time::Duration;

use anyhow::Result;
use kv_replication::persistence::MemoryPersistence;
use kv_replication::operation::{Snapshot, SnapshotAck};
use kv_replication::replicator::SnapshotDelivery;
use kv_replication::runtime::spawn_secondary;
use kv_replication::CoordinatorConfig;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::timeout;

fn snapshot(key: &str, value: Option<&str>, seq: u64) -> Snapshot {
    Snapshot {
        key: key.into(),
        value: value.map(str::to_string),
        seq,
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_snapshot_is_reacked_without_reapplying() -> Result<()> {
    let durable = MemoryPersistence::new();
    let backend = durable.clone();
    let secondary = spawn_secondary(2, CoordinatorConfig::default(), move || backend.clone())?;
    let link = secondary.link();
    let (reply_to, mut acks) = unbounded_channel();

    link.deliver(SnapshotDelivery {
        snapshot: snapshot("a", Some("1"), 0),
        reply_to: reply_to.clone(),
    });
    assert_eq!(
        acks.recv().await,
        Some(SnapshotAck {
            key: "a".into(),
            seq: 0
        })
    );
    assert_eq!(durable.get("a"), Some("1".to_string()));
    assert_eq!(secondary.status().await?.next_expected_seq, 1);

    link.deliver(SnapshotDelivery {
        snapshot: snapshot("a", Some("other"), 0),
        reply_to,
    });
    assert_eq!(
        acks.recv().await,
        Some(SnapshotAck {
            key: "a".into(),
            seq: 0
        })
    );

    let status = secondary.status().await?;
    assert_eq!(status.next_expected_seq, 1);
    assert_eq!(secondary.get("a").await?, Some("1".to_string()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn out_of_order_snapshot_is_dropped_until_resent() -> Result<()> {
    let secondary = spawn_secondary(2, CoordinatorConfig::default(), MemoryPersistence::new)?;
    let link = secondary.link();
    let (reply_to, mut acks) = unbounded_channel();

    link.deliver(SnapshotDelivery {
        snapshot: snapshot("b", Some("2"), 1),
        reply_to: reply_to.clone(),
    });
    let nothing = timeout(Duration::from_secs(1), acks.recv()).await;
    assert!(nothing.is_err(), "gap must not be acknowledged");
    assert_eq!(secondary.get("b").await?, None);

    for seq in 0..2 {
        let key = if seq == 0 { "a" } else { "b" };
        link.deliver(SnapshotDelivery {
            snapshot: snapshot(key, Some("x"), seq),
            reply_to: reply_to.clone(),
        });
        let ack = acks.recv().await.expect("secondary alive");
        assert_eq!(ack.seq, seq);
    }

    link.deliver(SnapshotDelivery {
        snapshot: snapshot("a", None, 2),
        reply_to,
    });
    acks.recv().await.expect("secondary alive");

    let status = secondary.status().await?;
    assert_eq!(status.next_expected_seq, 3);
    assert_eq!(status.store.get("a"), None);
    assert_eq!(status.store.get("b"), Some(&"x".to_string()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn second_replicator_is_refused() -> Result<()> {
    let secondary = spawn_secondary(2, CoordinatorConfig::default(), MemoryPersistence::new)?;
    let link = secondary.link();
    let (first, mut first_acks) = unbounded_channel();
    let (second, mut second_acks) = unbounded_channel();

    link.deliver(SnapshotDelivery {
        snapshot: snapshot("a", Some("1"), 0),
        reply_to: first.clone(),
    });
    assert_eq!(first_acks.recv().await.map(|ack| ack.seq), Some(0));

    // A replicator created after a rejoin starts over at seq 0; re-acking it
    // would report a catch-up that was never applied.
    link.deliver(SnapshotDelivery {
        snapshot: snapshot("b", Some("2"), 0),
        reply_to: second.clone(),
    });
    let nothing = timeout(Duration::from_secs(1), second_acks.recv()).await;
    assert!(nothing.is_err(), "second stream must not be acknowledged");
    assert_eq!(secondary.get("b").await?, None);

    link.deliver(SnapshotDelivery {
        snapshot: snapshot("c", Some("3"), 1),
        reply_to: first,
    });
    assert_eq!(first_acks.recv().await.map(|ack| ack.seq), Some(1));
    assert_eq!(secondary.status().await?.next_expected_seq, 2);
    Ok(())
}
