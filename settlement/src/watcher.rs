use crate::{
    collaborators::{FundsTransfer, TransferError, TransferHandle},
    ledger::{Ledger, LedgerError, StatusUpdate},
    metrics::SettlementMetrics,
    now_ms,
};
use prizeline_types::{FailureReason, PayoutId, PayoutRecord, PayoutStatus};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, error, info, warn};

/// Watch `handle` for at most `budget` and write the terminal state of `id`.
///
/// Resolves to the updated record, or `None` if the ledger refused the update.
pub(crate) fn spawn_watcher<L, T>(
    ledger: Arc<L>,
    transfer: T,
    metrics: SettlementMetrics,
    id: PayoutId,
    handle: TransferHandle,
    budget: Duration,
) -> JoinHandle<Option<PayoutRecord>>
where
    L: Ledger,
    T: FundsTransfer,
{
    metrics.pending_watchers.inc();
    tokio::spawn(async move {
        let outcome = timeout(budget, transfer.watch_confirmation(&handle)).await;
        let update = match outcome {
            Ok(Ok(confirmation)) => StatusUpdate::succeeded(confirmation.confirmed_block, now_ms()),
            Ok(Err(TransferError::Rejected(reason))) => {
                StatusUpdate::failed(FailureReason::Rejected.detail(reason), now_ms())
            }
            Ok(Err(TransferError::Transient(reason))) => {
                StatusUpdate::failed(FailureReason::Unconfirmed.detail(reason), now_ms())
            }
            Err(_) => StatusUpdate::failed(
                FailureReason::Timeout.detail(format!(
                    "no confirmation within {}ms",
                    budget.as_millis()
                )),
                now_ms(),
            ),
        }
        .with_transaction_ref(handle.transaction_ref.clone());
        let result = ledger.update_status(id, update);
        metrics.pending_watchers.dec();

        match result {
            Ok(record) => {
                match record.status {
                    PayoutStatus::Success => {
                        metrics.succeeded.inc();
                        info!(
                            tournament_id = id.tournament_id,
                            rank = id.rank,
                            attempt = id.attempt,
                            recipient = %record.recipient,
                            amount = %record.amount,
                            transaction_ref = %handle.transaction_ref,
                            confirmed_block = record.confirmed_block,
                            "payout confirmed"
                        );
                    }
                    _ => {
                        metrics.failed.inc();
                        warn!(
                            tournament_id = id.tournament_id,
                            rank = id.rank,
                            attempt = id.attempt,
                            recipient = %record.recipient,
                            amount = %record.amount,
                            transaction_ref = %handle.transaction_ref,
                            error = record.error_detail.as_deref().unwrap_or_default(),
                            "payout failed"
                        );
                    }
                }
                Some(record)
            }
            Err(LedgerError::ImmutableRecord { status, .. }) => {
                // Another watcher for the same record got there first.
                debug!(%id, %status, "payout already resolved");
                None
            }
            Err(err) => {
                error!(
                    %id,
                    transaction_ref = %handle.transaction_ref,
                    ?err,
                    "failed to record confirmation outcome"
                );
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ledger::MemoryLedger, mocks::MockTransfer};
    use prizeline_types::{Address, Amount};

    async fn submitted(
        ledger: &MemoryLedger,
        transfer: &MockTransfer,
        to: &Address,
    ) -> (PayoutId, TransferHandle) {
        let id = PayoutId::new(1, 1, 1);
        ledger
            .record(PayoutRecord::pending(id, to.clone(), Amount::new(10), now_ms()))
            .unwrap();
        let handle = transfer
            .submit_transfer(&Address::new("0xPAYER").unwrap(), to, Amount::new(10))
            .await
            .unwrap();
        (id, handle)
    }

    #[tokio::test]
    async fn confirmation_marks_success() {
        let ledger = Arc::new(MemoryLedger::new());
        let transfer = MockTransfer::new();
        let to = Address::new("0xAA").unwrap();
        let (id, handle) = submitted(&ledger, &transfer, &to).await;

        let metrics = SettlementMetrics::default();
        let record = spawn_watcher(
            ledger.clone(),
            transfer,
            metrics.clone(),
            id,
            handle,
            Duration::from_secs(5),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record.status, PayoutStatus::Success);
        assert!(record.confirmed_block.is_some());
        assert_eq!(metrics.succeeded.get(), 1);
        assert_eq!(metrics.pending_watchers.get(), 0);
    }

    #[tokio::test]
    async fn silence_past_budget_marks_timeout() {
        let ledger = Arc::new(MemoryLedger::new());
        let transfer = MockTransfer::new();
        let to = Address::new("0xAA").unwrap();
        transfer.hang(&to);
        let (id, handle) = submitted(&ledger, &transfer, &to).await;

        let record = spawn_watcher(
            ledger.clone(),
            transfer,
            SettlementMetrics::default(),
            id,
            handle,
            Duration::from_millis(50),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record.status, PayoutStatus::Failed);
        assert_eq!(record.failure_reason(), Some(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn reverted_transfer_marks_rejected() {
        let ledger = Arc::new(MemoryLedger::new());
        let transfer = MockTransfer::new();
        let to = Address::new("0xAA").unwrap();
        transfer.reject_confirmation(&to);
        let (id, handle) = submitted(&ledger, &transfer, &to).await;

        let record = spawn_watcher(
            ledger.clone(),
            transfer,
            SettlementMetrics::default(),
            id,
            handle,
            Duration::from_secs(5),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record.failure_reason(), Some(FailureReason::Rejected));
    }
}
