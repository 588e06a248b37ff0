//! Scripted collaborators for tests.

use crate::{
    cancel::CancelHandle,
    collaborators::{
        BalanceSource, Confirmation, FundsTransfer, StandingsSource, TransferError, TransferHandle,
    },
};
use prizeline_types::{Address, Amount, StandingEntry, TournamentId};
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::watch;

/// A transfer observed by [MockTransfer].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub transaction_ref: String,
}

#[derive(Default)]
struct TransferState {
    submissions: Vec<Submission>,
    /// Transient failures left before a submission to the recipient goes through.
    transient: HashMap<Address, u32>,
    reject_submit: HashSet<Address>,
    reject_confirm: HashSet<Address>,
    hang: HashSet<Address>,
    /// Recipient of every acknowledged reference.
    refs: HashMap<String, Address>,
    /// Outcomes for references this instance never issued (e.g. before a restart).
    known: HashMap<String, Result<Confirmation, TransferError>>,
    hung_refs: HashSet<String>,
    next_ref: u64,
    next_block: u64,
    in_flight: usize,
    max_in_flight: usize,
    cancel_after: Option<(usize, CancelHandle)>,
}

/// Transfer collaborator with per-recipient scripted behavior.
///
/// Confirmations resolve immediately unless [MockTransfer::hold] is active.
#[derive(Clone)]
pub struct MockTransfer {
    state: Arc<Mutex<TransferState>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for MockTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransfer {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(TransferState {
                next_block: 100,
                ..Default::default()
            })),
            gate: Arc::new(gate),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` submissions to `to` with a transient error.
    pub fn fail_transiently(&self, to: &Address, count: u32) {
        self.state().transient.insert(to.clone(), count);
    }

    /// Reject every submission to `to`.
    pub fn reject_submission(&self, to: &Address) {
        self.state().reject_submit.insert(to.clone());
    }

    /// Accept submissions to `to` but report their confirmation as rejected.
    pub fn reject_confirmation(&self, to: &Address) {
        self.state().reject_confirm.insert(to.clone());
    }

    /// Never confirm transfers to `to`.
    pub fn hang(&self, to: &Address) {
        self.state().hang.insert(to.clone());
    }

    /// Clear every scripted behavior for `to`.
    pub fn heal(&self, to: &Address) {
        let mut state = self.state();
        state.transient.remove(to);
        state.reject_submit.remove(to);
        state.reject_confirm.remove(to);
        state.hang.remove(to);
    }

    /// Script the outcome of watching a reference issued elsewhere.
    pub fn script_ref(
        &self,
        transaction_ref: impl Into<String>,
        outcome: Result<Confirmation, TransferError>,
    ) {
        self.state().known.insert(transaction_ref.into(), outcome);
    }

    /// Never confirm a reference issued elsewhere.
    pub fn hang_ref(&self, transaction_ref: impl Into<String>) {
        self.state().hung_refs.insert(transaction_ref.into());
    }

    /// Hold every confirmation until [MockTransfer::release] is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Cancel `handle` once `submissions` transfers have been acknowledged.
    pub fn cancel_after(&self, submissions: usize, handle: CancelHandle) {
        self.state().cancel_after = Some((submissions, handle));
    }

    /// Acknowledged submissions, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    /// Number of submission calls made, including failed ones.
    pub fn submit_calls(&self) -> usize {
        self.state().next_ref as usize
    }

    /// Most submissions observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }
}

impl FundsTransfer for MockTransfer {
    async fn submit_transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<TransferHandle, TransferError> {
        {
            let mut state = self.state();
            state.next_ref += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        // Yield so overlapping submissions from concurrent callers would be observed.
        tokio::task::yield_now().await;

        let mut state = self.state();
        state.in_flight -= 1;
        if state.reject_submit.contains(to) {
            return Err(TransferError::Rejected(format!("{to} is not payable")));
        }
        if let Some(remaining) = state.transient.get_mut(to) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransferError::Transient("connection reset".to_string()));
            }
        }
        let transaction_ref = format!("0xmock{}", state.next_ref);
        state.refs.insert(transaction_ref.clone(), to.clone());
        state.submissions.push(Submission {
            from: from.clone(),
            to: to.clone(),
            amount,
            transaction_ref: transaction_ref.clone(),
        });
        if let Some((after, handle)) = &state.cancel_after {
            if state.submissions.len() >= *after {
                handle.cancel();
            }
        }
        Ok(TransferHandle::new(transaction_ref))
    }

    async fn watch_confirmation(
        &self,
        handle: &TransferHandle,
    ) -> Result<Confirmation, TransferError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let outcome = {
            let mut state = self.state();
            let scripted = state.known.get(&handle.transaction_ref).cloned();
            if state.hung_refs.contains(&handle.transaction_ref) {
                None
            } else if scripted.is_some() {
                scripted
            } else {
                match state.refs.get(&handle.transaction_ref).cloned() {
                    None => Some(Err(TransferError::Transient(format!(
                        "unknown transaction {}",
                        handle.transaction_ref
                    )))),
                    Some(to) if state.hang.contains(&to) => None,
                    Some(to) if state.reject_confirm.contains(&to) => {
                        Some(Err(TransferError::Rejected("execution reverted".to_string())))
                    }
                    Some(_) => {
                        state.next_block += 1;
                        Some(Ok(Confirmation {
                            confirmed_block: state.next_block,
                        }))
                    }
                }
            }
        };
        match outcome {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }
}

/// Balance collaborator backed by a map.
#[derive(Clone, Default)]
pub struct MockBalance {
    balances: Arc<Mutex<HashMap<Address, Amount>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockBalance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, account: &Address, amount: Amount) {
        self.balances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(account.clone(), amount);
    }

    /// Fail every query with `message`.
    pub fn fail_with(&self, message: &str) {
        *self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message.to_string());
    }
}

impl BalanceSource for MockBalance {
    type Error = io::Error;

    async fn available_balance(&self, account: &Address) -> Result<Amount, io::Error> {
        if let Some(message) = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, message));
        }
        Ok(self
            .balances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account)
            .copied()
            .unwrap_or(Amount::ZERO))
    }
}

/// Standings collaborator backed by a map.
#[derive(Clone, Default)]
pub struct MockStandings {
    standings: Arc<Mutex<HashMap<TournamentId, Vec<StandingEntry>>>>,
}

impl MockStandings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tournament_id: TournamentId, entries: Vec<StandingEntry>) {
        self.standings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(tournament_id, entries);
    }
}

impl StandingsSource for MockStandings {
    type Error = io::Error;

    async fn standings(&self, tournament_id: TournamentId) -> Result<Vec<StandingEntry>, io::Error> {
        self.standings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&tournament_id)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("tournament {tournament_id} has no final standings"),
                )
            })
    }
}
