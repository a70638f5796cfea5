//! End-to-end export flow: submit, consume, ack, restart

use bank_core::{Config, Error, Export, ExportInProgress, Ledger, UserId};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.outbox.block_timeout_ms = 50;
    config
}

struct Consumer {
    cancel: CancellationToken,
    rx: mpsc::Receiver<ExportInProgress>,
    task: JoinHandle<()>,
}

impl Consumer {
    fn spawn(ledger: &Ledger) -> Self {
        let exports = ledger.exports();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { exports.run_consumer(&cancel, &tx).await })
        };
        Self { cancel, rx, task }
    }

    async fn recv(&mut self) -> ExportInProgress {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for export")
            .expect("consumer stopped")
    }

    async fn expect_nothing(&mut self, wait: Duration) {
        if let Ok(Some(export)) = tokio::time::timeout(wait, self.rx.recv()).await {
            panic!("unexpected export {:?}", export.id);
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_balance_transfer_and_export_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).unwrap();
    let (a, b) = (UserId::new("A"), UserId::new("B"));

    assert_eq!(ledger.balance(&a).unwrap(), 0);
    assert_eq!(ledger.incr(&a, 10).unwrap(), 10);
    assert_eq!(ledger.transfer(&b, &a, 3).unwrap(), (3, 7));
    assert_eq!(ledger.balance(&a).unwrap(), 7);
    assert_eq!(ledger.balance(&b).unwrap(), 3);

    let id = ledger
        .exports()
        .submit_export(Export::new(a.clone(), 5, "chain", "payload"))
        .unwrap();
    assert_eq!(ledger.balance(&a).unwrap(), 2);

    let mut consumer = Consumer::spawn(&ledger);
    let delivered = consumer.recv().await;
    assert_eq!(delivered.id, id);
    assert_eq!(delivered.export, Export::new(a.clone(), 5, "chain", "payload"));
    delivered.ack().unwrap();
    consumer.stop().await;

    let mut consumer = Consumer::spawn(&ledger);
    consumer.expect_nothing(Duration::from_millis(200)).await;
    consumer.stop().await;
    assert!(ledger.outbox().pending("bank.exports").unwrap().is_empty());
}

#[tokio::test]
async fn test_overdrawn_transfer_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).unwrap();
    let (a, b) = (UserId::new("A"), UserId::new("B"));
    ledger.incr(&a, 7).unwrap();

    let err = ledger.transfer(&b, &a, 100).unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientFunds {
            balance: 7,
            requested: 100,
            ..
        }
    ));
    assert_eq!(ledger.balance(&a).unwrap(), 7);
    assert_eq!(ledger.balance(&b).unwrap(), 0);
}

#[tokio::test]
async fn test_unacked_export_survives_restart_and_acked_does_not() {
    let temp_dir = TempDir::new().unwrap();
    let a = UserId::new("A");

    let (acked, unacked) = {
        let ledger = Ledger::open(test_config(&temp_dir)).unwrap();
        ledger.incr(&a, 10).unwrap();
        let exports = ledger.exports();
        let first = exports.submit_export(Export::new(a.clone(), 1, "chain", "one")).unwrap();
        let second = exports.submit_export(Export::new(a.clone(), 2, "chain", "two")).unwrap();

        let mut consumer = Consumer::spawn(&ledger);
        let one = consumer.recv().await;
        let two = consumer.recv().await;
        assert_eq!((one.id, two.id), (first, second));
        one.ack().unwrap();
        // Crash before settling the second export
        drop(two);
        consumer.stop().await;
        // Handles keep the database open
        drop(one);
        drop(exports);
        ledger.close().unwrap();
        (first, second)
    };

    let ledger = Ledger::open(test_config(&temp_dir)).unwrap();
    assert_eq!(ledger.balance(&a).unwrap(), 7);

    let mut consumer = Consumer::spawn(&ledger);
    let again = consumer.recv().await;
    assert_eq!(again.id, unacked);
    assert_ne!(again.id, acked);
    assert_eq!(again.delivery_count, 2);
    assert_eq!(again.export.protocol_payload, "two");
    again.ack().unwrap();
    // Acking twice is harmless
    again.ack().unwrap();

    consumer.expect_nothing(Duration::from_millis(200)).await;
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_consumers_split_exports() {
    let temp_dir = TempDir::new().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).unwrap();
    let a = UserId::new("A");
    ledger.incr(&a, 1_000).unwrap();

    let exports = ledger.exports();
    let mut submitted = HashSet::new();
    for i in 0..20 {
        let id = exports
            .submit_export(Export::new(a.clone(), 1, "chain", format!("p{}", i)))
            .unwrap();
        submitted.insert(id);
    }

    let (tx, mut rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let workers: Vec<_> = (0..3)
        .map(|n| {
            let exports = ledger.exports().with_consumer(format!("worker-{}", n));
            let (tx, cancel) = (tx.clone(), cancel.clone());
            tokio::spawn(async move { exports.run_consumer(&cancel, &tx).await })
        })
        .collect();
    drop(tx);

    let mut seen = HashSet::new();
    while seen.len() < submitted.len() {
        let export = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        export.ack().unwrap();
        assert!(seen.insert(export.id), "export {} delivered twice", export.id);
    }
    assert_eq!(seen, submitted);

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
    assert!(ledger.outbox().pending("bank.exports").unwrap().is_empty());
    assert_eq!(ledger.metrics().exports_acked.get(), 20);
}

#[tokio::test]
async fn test_nack_then_refund() {
    let temp_dir = TempDir::new().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).unwrap();
    let a = UserId::new("A");
    ledger.incr(&a, 5).unwrap();
    ledger
        .exports()
        .submit_export(Export::new(a.clone(), 5, "chain", "bad-destination"))
        .unwrap();

    let mut consumer = Consumer::spawn(&ledger);
    let first = consumer.recv().await;
    first.nack();

    // The worker gives up: ack to drop it from the queue and refund the user
    let retry = consumer.recv().await;
    assert_eq!(retry.id, first.id);
    retry.ack().unwrap();
    ledger.incr(&retry.export.from_user_id, retry.export.amount).unwrap();
    consumer.stop().await;

    assert_eq!(ledger.balance(&a).unwrap(), 5);
}
