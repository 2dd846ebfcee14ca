use chargebill::ChargeError;
use chargebill::ledger::{FileLedger, Ledger, MemoryLedger, TransactionKind, WalletTransaction};
use chargebill::retry::RetryConfig;
use chargebill::wallet::Wallet;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_millis(2),
    }
}

fn wallet() -> (Wallet, Arc<MemoryLedger>) {
    let ledger = Arc::new(MemoryLedger::new());
    (Wallet::new(ledger.clone(), fast_retry()), ledger)
}

#[tokio::test]
async fn credit_and_debit_move_the_balance() {
    let (wallet, ledger) = wallet();
    wallet.credit("user-1", dec!(25), "Wallet Top-up").await.unwrap();
    let tx = wallet
        .debit("user-1", dec!(7.455), "Adjustment", None)
        .await
        .unwrap();
    // Amounts are rounded half away from zero
    assert_eq!(tx.amount, dec!(7.46));
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(17.54));

    let kinds: Vec<_> = ledger
        .transactions("user-1")
        .await
        .unwrap()
        .iter()
        .map(|t| t.kind)
        .collect();
    assert_eq!(kinds, vec![TransactionKind::TopUp, TransactionKind::Deduction]);
}

#[tokio::test]
async fn overdraw_is_refused() {
    let (wallet, ledger) = wallet();
    wallet.credit("user-1", dec!(5), "Wallet Top-up").await.unwrap();
    let err = wallet
        .debit("user-1", dec!(5.01), "Adjustment", None)
        .await
        .unwrap_err();
    match err {
        ChargeError::InsufficientFunds {
            requested,
            available,
        } => {
            assert_eq!(requested, dec!(5.01));
            assert_eq!(available, dec!(5));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ledger.transactions("user-1").await.unwrap().len(), 1);
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(5));
}

#[tokio::test]
async fn non_positive_and_invalid_inputs_are_rejected() {
    let (wallet, _) = wallet();
    assert!(matches!(
        wallet.credit("user-1", dec!(0), "Wallet Top-up").await,
        Err(ChargeError::Validation { .. })
    ));
    assert!(matches!(
        wallet.credit("user-1", dec!(-3), "Wallet Top-up").await,
        Err(ChargeError::Validation { .. })
    ));
    assert!(matches!(
        wallet.get_balance("bad/user").await,
        Err(ChargeError::Validation { .. })
    ));
    assert!(matches!(
        wallet.get_balance("").await,
        Err(ChargeError::Validation { .. })
    ));
}

#[tokio::test]
async fn holds_reduce_available_but_not_committed() {
    let (wallet, _) = wallet();
    wallet.credit("user-1", dec!(10), "Wallet Top-up").await.unwrap();

    let hold = wallet.hold("user-1", "session-1", dec!(4)).await.unwrap();
    assert_eq!(hold.granted, dec!(4));
    assert!(!hold.capped);
    assert_eq!(hold.available_after, dec!(6));

    let hold = wallet.hold("user-1", "session-1", dec!(8)).await.unwrap();
    assert_eq!(hold.granted, dec!(6));
    assert!(hold.capped);
    assert_eq!(hold.available_after, dec!(0));

    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(0));
    assert_eq!(wallet.committed_balance("user-1").await.unwrap(), dec!(10));

    assert_eq!(wallet.release("user-1", "session-1").await.unwrap(), dec!(10));
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(10));
}

#[tokio::test]
async fn settlement_is_idempotent() {
    let (wallet, ledger) = wallet();
    wallet.credit("user-1", dec!(10), "Wallet Top-up").await.unwrap();
    wallet.hold("user-1", "session-1", dec!(3.333)).await.unwrap();

    let first = wallet
        .settle("user-1", "session-1", dec!(3.333), "Charging session - 0.417 kWh")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.amount, dec!(3.33));
    assert_eq!(first.session_id.as_deref(), Some("session-1"));

    let second = wallet
        .settle("user-1", "session-1", dec!(3.333), "Charging session - 0.417 kWh")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);

    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(6.67));
    assert_eq!(ledger.transactions("user-1").await.unwrap().len(), 2);
    assert_eq!(wallet.reconcile("user-1").await.unwrap(), dec!(6.67));
}

#[tokio::test]
async fn settlement_is_capped_at_balance() {
    let (wallet, _) = wallet();
    wallet.credit("user-1", dec!(2), "Wallet Top-up").await.unwrap();
    let tx = wallet
        .settle("user-1", "session-1", dec!(2.50), "Charging session")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.amount, dec!(2));
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(0));

    let nothing = wallet
        .settle("user-1", "session-2", dec!(0.001), "Charging session")
        .await
        .unwrap();
    assert!(nothing.is_none());
}

#[tokio::test]
async fn failed_settlement_keeps_the_hold() {
    let (wallet, ledger) = wallet();
    wallet.credit("user-1", dec!(10), "Wallet Top-up").await.unwrap();
    wallet.hold("user-1", "session-1", dec!(2)).await.unwrap();

    ledger.fail_next_writes(3);
    let err = wallet
        .settle("user-1", "session-1", dec!(2), "Charging session")
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(8));
    assert_eq!(wallet.committed_balance("user-1").await.unwrap(), dec!(10));

    wallet
        .settle("user-1", "session-1", dec!(2), "Charging session")
        .await
        .unwrap();
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(8));
    assert_eq!(wallet.committed_balance("user-1").await.unwrap(), dec!(8));
}

#[tokio::test]
async fn transient_write_failures_are_retried() {
    let (wallet, ledger) = wallet();
    ledger.fail_next_writes(2);
    wallet.credit("user-1", dec!(10), "Wallet Top-up").await.unwrap();
    assert_eq!(ledger.transactions("user-1").await.unwrap().len(), 1);
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_top_ups_all_land() {
    let (wallet, ledger) = wallet();
    let wallet = Arc::new(wallet);

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let wallet = wallet.clone();
        tasks.push(tokio::spawn(async move {
            wallet.credit("user-1", dec!(10), "Wallet Top-up").await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(500));
    assert_eq!(ledger.transactions("user-1").await.unwrap().len(), 50);
    assert_eq!(wallet.reconcile("user-1").await.unwrap(), dec!(500));
}

#[tokio::test]
async fn balance_is_rebuilt_from_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    {
        let ledger: Arc<dyn Ledger> = Arc::new(FileLedger::open(dir.path()).await.unwrap());
        let wallet = Wallet::new(ledger, fast_retry());
        wallet.credit("user-1", dec!(30), "Wallet Top-up").await.unwrap();
        wallet
            .settle("user-1", "session-1", dec!(4.44), "Charging session")
            .await
            .unwrap();
    }

    let ledger: Arc<dyn Ledger> = Arc::new(FileLedger::open(dir.path()).await.unwrap());
    let wallet = Wallet::new(ledger.clone(), fast_retry());
    assert_eq!(wallet.load_from_ledger().await.unwrap(), 1);
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(25.56));

    // Replaying the settlement after a restart does not charge again
    let again = wallet
        .settle("user-1", "session-1", dec!(4.44), "Charging session")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, WalletTransaction::settlement("user-1", "session-1", dec!(4.44), "").id);
    assert_eq!(wallet.get_balance("user-1").await.unwrap(), dec!(25.56));
    assert_eq!(wallet.total_deducted("user-1").await.unwrap(), dec!(4.44));
}
