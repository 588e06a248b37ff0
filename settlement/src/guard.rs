//! All-or-nothing funding check.
//!
//! A batch is only submitted when the payer can cover every payout in it. Partially funding a
//! batch would pay the top ranks and strand the rest, so the guard refuses instead.

use crate::{collaborators::BalanceSource, Error, Result};
use prizeline_types::{Address, Amount};
use tracing::{debug, warn};

/// Proof that a batch was checked against the payer's balance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorization {
    pub payer: Address,
    pub total: Amount,
    /// Amount of earlier payouts still PENDING, held back from the balance.
    pub committed: Amount,
    /// Spendable balance at the time of the check (balance minus reserve and committed).
    pub available: Amount,
}

/// Checks a payer's balance before a batch is submitted.
#[derive(Clone, Debug)]
pub struct BalanceGuard<B> {
    balances: B,
    reserve: Amount,
}

impl<B: BalanceSource> BalanceGuard<B> {
    /// `reserve` is held back from every check (for example, to pay network fees).
    pub fn new(balances: B, reserve: Amount) -> Self {
        Self { balances, reserve }
    }

    /// Authorize spending `total` from `payer` on top of `committed`, the sum of payouts
    /// already submitted but not yet resolved.
    ///
    /// An empty batch is authorized without querying the balance.
    pub async fn authorize(
        &self,
        payer: &Address,
        total: Amount,
        committed: Amount,
    ) -> Result<Authorization> {
        if total.is_zero() {
            return Ok(Authorization {
                payer: payer.clone(),
                total,
                committed,
                available: Amount::ZERO,
            });
        }
        let balance = self
            .balances
            .available_balance(payer)
            .await
            .map_err(|err| Error::Balance {
                payer: payer.clone(),
                source: Box::new(err),
            })?;
        let available = balance
            .saturating_sub(self.reserve)
            .saturating_sub(committed);
        if available < total {
            warn!(%payer, %total, %committed, %available, "insufficient funds for batch");
            return Err(Error::InsufficientFunds {
                payer: payer.clone(),
                required: total,
                available,
            });
        }
        debug!(%payer, %total, %committed, %available, "batch authorized");
        Ok(Authorization {
            payer: payer.clone(),
            total,
            committed,
            available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockBalance;

    fn payer() -> Address {
        Address::new("0xPAYER").unwrap()
    }

    #[tokio::test]
    async fn authorizes_exact_balance() {
        let balances = MockBalance::new();
        balances.set(&payer(), Amount::new(175));
        let guard = BalanceGuard::new(balances, Amount::ZERO);
        let auth = guard
            .authorize(&payer(), Amount::new(175), Amount::ZERO)
            .await
            .unwrap();
        assert_eq!(auth.total, Amount::new(175));
        assert_eq!(auth.available, Amount::new(175));
    }

    #[tokio::test]
    async fn reserve_is_held_back() {
        let balances = MockBalance::new();
        balances.set(&payer(), Amount::new(200));
        let guard = BalanceGuard::new(balances, Amount::new(30));
        let err = guard
            .authorize(&payer(), Amount::new(175), Amount::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds { required, available, .. }
                if required == Amount::new(175) && available == Amount::new(170)
        ));
    }

    #[tokio::test]
    async fn committed_payouts_are_held_back() {
        let balances = MockBalance::new();
        balances.set(&payer(), Amount::new(150));
        let guard = BalanceGuard::new(balances, Amount::new(10));
        let err = guard
            .authorize(&payer(), Amount::new(100), Amount::new(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds { required, available, .. }
                if required == Amount::new(100) && available == Amount::new(40)
        ));

        let auth = guard
            .authorize(&payer(), Amount::new(40), Amount::new(100))
            .await
            .unwrap();
        assert_eq!(auth.committed, Amount::new(100));
        assert_eq!(auth.available, Amount::new(40));

        // More committed than the balance leaves nothing, without underflow.
        assert!(guard
            .authorize(&payer(), Amount::new(1), Amount::new(1_000))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn balance_errors_propagate() {
        let balances = MockBalance::new();
        balances.fail_with("rpc down");
        let guard = BalanceGuard::new(balances, Amount::ZERO);
        let err = guard
            .authorize(&payer(), Amount::new(1), Amount::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Balance { .. }));
    }

    #[tokio::test]
    async fn empty_batch_skips_balance_query() {
        let balances = MockBalance::new();
        balances.fail_with("must not be called");
        let guard = BalanceGuard::new(balances, Amount::ZERO);
        assert!(guard
            .authorize(&payer(), Amount::ZERO, Amount::new(5))
            .await
            .is_ok());
    }
}
