//! Native-asset transfers on an EVM chain.
//!
//! Transfers are signed locally, so a transfer whose broadcast got no clear answer can be
//! sent again byte for byte. A node that already has it reports it as known, and the payout
//! is never signed a second time under a fresh nonce.

use crate::{Error, Result};
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{
        transaction::eip2718::TypedTransaction, Address as EvmAddress, BlockNumber, Bytes,
        TransactionRequest, H256, U256, U64,
    },
};
use prizeline_settlement::{
    BalanceSource, Confirmation, FundsTransfer, TransferError, TransferHandle,
};
use prizeline_types::{Address, Amount};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

type EvmClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Connection settings for [EvmTransfer].
#[derive(Clone)]
pub struct EvmTransferConfig {
    pub rpc_url: String,
    pub private_key: String,
    pub chain_id: u64,
    /// Blocks a receipt must be buried under before the transfer counts as confirmed.
    pub confirmations: u64,
    pub poll_interval: Duration,
    /// Bound on a single JSON-RPC request.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for EvmTransferConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmTransferConfig")
            .field("rpc_url", &self.rpc_url)
            .field("private_key", &"<redacted>")
            .field("chain_id", &self.chain_id)
            .field("confirmations", &self.confirmations)
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// HTTP provider whose requests give up after `request_timeout`.
pub fn http_provider(rpc_url: &str, request_timeout: Duration) -> Result<Provider<Http>> {
    let url = Url::parse(rpc_url)?;
    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()?;
    Ok(Provider::new(Http::new_with_client(url, client)))
}

/// Assigns nonces locally so back-to-back submissions do not wait for the mempool.
#[derive(Default)]
struct NonceTracker {
    next_nonce: Option<U256>,
}

impl NonceTracker {
    async fn sync(
        &mut self,
        client: &EvmClient,
        payer: EvmAddress,
    ) -> std::result::Result<U256, TransferError> {
        let nonce = client
            .get_transaction_count(payer, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|err| TransferError::Transient(format!("nonce lookup failed: {err}")))?;
        self.next_nonce = Some(nonce);
        Ok(nonce)
    }

    async fn next(
        &mut self,
        client: &EvmClient,
        payer: EvmAddress,
    ) -> std::result::Result<U256, TransferError> {
        let nonce = match self.next_nonce {
            Some(nonce) => nonce,
            None => self.sync(client, payer).await?,
        };
        self.next_nonce = Some(nonce.saturating_add(U256::one()));
        Ok(nonce)
    }

    /// Forget the local nonce; the next submission resyncs from the chain.
    fn reset(&mut self) {
        self.next_nonce = None;
    }
}

/// A transfer signed and ready to broadcast.
#[derive(Clone, Debug)]
struct SignedTransfer {
    to: EvmAddress,
    value: U256,
    nonce: U256,
    gas_price: U256,
    raw: Bytes,
    hash: H256,
}

impl SignedTransfer {
    fn pays(&self, to: EvmAddress, value: U256) -> bool {
        self.to == to && self.value == value
    }

    fn handle(&self) -> TransferHandle {
        TransferHandle::new(format!("{:#x}", self.hash))
    }
}

#[derive(Default)]
struct SubmitState {
    nonces: NonceTracker,
    /// Last transfer whose broadcast got no definite answer. It may be in the mempool.
    unacknowledged: Option<SignedTransfer>,
}

/// What a node's reply to `eth_sendRawTransaction` says about the transaction.
#[derive(Debug, PartialEq, Eq)]
enum Broadcast {
    /// The node has the transaction, now or from an earlier broadcast.
    Known,
    /// The nonce is already used on chain.
    NonceUsed,
    /// The node refused the transaction; it is not in the mempool.
    Refused(TransferError),
    /// No reliable answer. The transaction may or may not have reached the node.
    Unknown(String),
}

struct Inner {
    client: EvmClient,
    payer: EvmAddress,
    payer_address: Address,
    chain_id: u64,
    confirmations: u64,
    poll_interval: Duration,
    state: Mutex<SubmitState>,
}

/// [FundsTransfer] sending native-asset transfers signed by a local wallet.
///
/// Amounts are in the chain's base unit (wei).
#[derive(Clone)]
pub struct EvmTransfer {
    inner: Arc<Inner>,
}

impl EvmTransfer {
    pub fn connect(config: EvmTransferConfig) -> Result<Self> {
        let provider = http_provider(&config.rpc_url, config.request_timeout)?
            .interval(config.poll_interval);
        let wallet: LocalWallet = config
            .private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|err| Error::InvalidPrivateKey(format!("{err}")))?;
        let wallet = wallet.with_chain_id(config.chain_id);
        let payer = wallet.address();
        let payer_address = format_address(payer)?;
        info!(
            payer = %format!("{payer:#x}"),
            chain_id = config.chain_id,
            "EVM transfer client ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                client: SignerMiddleware::new(provider, wallet),
                payer,
                payer_address,
                chain_id: config.chain_id,
                confirmations: config.confirmations,
                poll_interval: config.poll_interval,
                state: Mutex::new(SubmitState::default()),
            }),
        })
    }

    /// Account the wallet signs for.
    pub fn payer(&self) -> Address {
        self.inner.payer_address.clone()
    }

    pub fn provider(&self) -> &Provider<Http> {
        self.inner.client.inner()
    }

    /// Fill gas fields and sign a transfer of `value` to `to` at `nonce`.
    ///
    /// The gas price is raised to `gas_floor` when the node quotes less.
    async fn sign(
        &self,
        to: EvmAddress,
        value: U256,
        nonce: U256,
        gas_floor: Option<U256>,
    ) -> std::result::Result<SignedTransfer, TransferError> {
        let inner = &self.inner;
        let mut tx: TypedTransaction = TransactionRequest::pay(to, value)
            .from(inner.payer)
            .nonce(nonce)
            .chain_id(inner.chain_id)
            .into();
        inner
            .client
            .fill_transaction(&mut tx, None)
            .await
            .map_err(|err| match classify_broadcast(&err.to_string()) {
                Broadcast::Refused(refused) => refused,
                _ => TransferError::Transient(format!("could not prepare transfer: {err}")),
            })?;
        if let Some(floor) = gas_floor {
            if tx.gas_price().map_or(true, |price| price < floor) {
                tx.set_gas_price(floor);
            }
        }
        let signature = inner
            .client
            .signer()
            .sign_transaction(&tx)
            .await
            .map_err(|err| TransferError::Rejected(format!("could not sign transfer: {err}")))?;
        Ok(SignedTransfer {
            to,
            value,
            nonce,
            gas_price: tx.gas_price().unwrap_or_default(),
            raw: tx.rlp_signed(&signature),
            hash: tx.hash(&signature),
        })
    }

    async fn broadcast(&self, signed: &SignedTransfer) -> Broadcast {
        match self
            .provider()
            .send_raw_transaction(signed.raw.clone())
            .await
        {
            Ok(pending) => {
                let reported = *pending;
                if reported != signed.hash {
                    warn!(
                        tx_hash = %format!("{:#x}", signed.hash),
                        reported = %format!("{reported:#x}"),
                        "node reported a different transaction hash"
                    );
                }
                Broadcast::Known
            }
            Err(err) => classify_broadcast(&err.to_string()),
        }
    }

    /// Send `unacknowledged` again, unchanged.
    async fn rebroadcast(
        &self,
        state: &mut SubmitState,
        unacknowledged: SignedTransfer,
    ) -> std::result::Result<TransferHandle, TransferError> {
        let tx_hash = format!("{:#x}", unacknowledged.hash);
        match self.broadcast(&unacknowledged).await {
            // The node has seen this exact transaction, or its nonce was consumed, most
            // likely by this transaction being mined.
            Broadcast::Known | Broadcast::NonceUsed => {
                debug!(
                    %tx_hash,
                    nonce = %unacknowledged.nonce,
                    "transfer acknowledged on resend"
                );
                Ok(unacknowledged.handle())
            }
            Broadcast::Refused(err) => {
                state.nonces.reset();
                Err(err)
            }
            Broadcast::Unknown(message) => {
                debug!(%tx_hash, %message, "transfer still unacknowledged");
                state.unacknowledged = Some(unacknowledged);
                Err(TransferError::Transient(message))
            }
        }
    }

    /// Sign a transfer over the nonce of `earlier`, so at most one of the two is mined.
    async fn replace(
        &self,
        state: &mut SubmitState,
        earlier: SignedTransfer,
        to: EvmAddress,
        value: U256,
    ) -> std::result::Result<TransferHandle, TransferError> {
        let earlier_hash = format!("{:#x}", earlier.hash);
        warn!(
            earlier = %earlier_hash,
            nonce = %earlier.nonce,
            "replacing an unacknowledged transfer"
        );
        let signed = match self
            .sign(to, value, earlier.nonce, Some(replacement_gas_price(earlier.gas_price)))
            .await
        {
            Ok(signed) => signed,
            Err(err) => {
                state.unacknowledged = Some(earlier);
                return Err(err);
            }
        };
        match self.broadcast(&signed).await {
            Broadcast::Known => {
                debug!(
                    tx_hash = %format!("{:#x}", signed.hash),
                    nonce = %signed.nonce,
                    "replacement transfer sent"
                );
                Ok(signed.handle())
            }
            Broadcast::NonceUsed => {
                error!(
                    earlier = %earlier_hash,
                    nonce = %earlier.nonce,
                    "an unacknowledged transfer was mined; its payout may already be paid"
                );
                state.nonces.reset();
                Err(TransferError::Transient(format!(
                    "nonce {} already used by {earlier_hash}",
                    earlier.nonce
                )))
            }
            Broadcast::Refused(err) => {
                state.unacknowledged = Some(earlier);
                Err(err)
            }
            Broadcast::Unknown(message) => {
                state.unacknowledged = Some(signed);
                Err(TransferError::Transient(message))
            }
        }
    }

    async fn send_new(
        &self,
        state: &mut SubmitState,
        to: EvmAddress,
        value: U256,
    ) -> std::result::Result<TransferHandle, TransferError> {
        let nonce = state.nonces.next(&self.inner.client, self.inner.payer).await?;
        let signed = match self.sign(to, value, nonce, None).await {
            Ok(signed) => signed,
            Err(err) => {
                state.nonces.reset();
                return Err(err);
            }
        };
        let tx_hash = format!("{:#x}", signed.hash);
        match self.broadcast(&signed).await {
            Broadcast::Known => {
                debug!(%tx_hash, %nonce, "transfer sent");
                Ok(signed.handle())
            }
            Broadcast::NonceUsed => {
                state.nonces.reset();
                Err(TransferError::Transient(format!("nonce {nonce} already used")))
            }
            Broadcast::Refused(err) => {
                state.nonces.reset();
                Err(err)
            }
            Broadcast::Unknown(message) => {
                warn!(
                    %tx_hash,
                    %nonce,
                    %message,
                    "transfer unacknowledged; holding it for resend"
                );
                state.unacknowledged = Some(signed);
                Err(TransferError::Transient(message))
            }
        }
    }
}

impl FundsTransfer for EvmTransfer {
    async fn submit_transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> std::result::Result<TransferHandle, TransferError> {
        let inner = &self.inner;
        let from = parse_address(from)
            .map_err(|err| TransferError::Rejected(format!("invalid payer: {err}")))?;
        if from != inner.payer {
            return Err(TransferError::Rejected(format!(
                "payer {from:#x} does not match signer {:#x}",
                inner.payer
            )));
        }
        let to = parse_address(to)
            .map_err(|err| TransferError::Rejected(format!("invalid recipient: {err}")))?;
        let value = to_wei(amount);

        let mut state = inner.state.lock().await;
        match state.unacknowledged.take() {
            Some(earlier) if earlier.pays(to, value) => {
                self.rebroadcast(&mut state, earlier).await
            }
            Some(earlier) => self.replace(&mut state, earlier, to, value).await,
            None => self.send_new(&mut state, to, value).await,
        }
    }

    async fn watch_confirmation(
        &self,
        handle: &TransferHandle,
    ) -> std::result::Result<Confirmation, TransferError> {
        let inner = &self.inner;
        let tx_hash = H256::from_str(&handle.transaction_ref).map_err(|err| {
            TransferError::Rejected(format!(
                "malformed transaction reference {}: {err}",
                handle.transaction_ref
            ))
        })?;
        let provider = inner.client.inner();
        loop {
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status == Some(U64::zero()) {
                        return Err(TransferError::Rejected(format!(
                            "transaction {tx_hash:#x} reverted"
                        )));
                    }
                    if let Some(block) = receipt.block_number.map(|number| number.as_u64()) {
                        match provider.get_block_number().await {
                            Ok(latest) if is_final(block, latest.as_u64(), inner.confirmations) => {
                                return Ok(Confirmation {
                                    confirmed_block: block,
                                });
                            }
                            Ok(_) => {}
                            Err(err) => warn!(?err, "block number lookup failed"),
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(tx_hash = %format!("{tx_hash:#x}"), ?err, "receipt lookup failed"),
            }
            tokio::time::sleep(inner.poll_interval).await;
        }
    }
}

/// Balance lookups against an EVM node.
#[derive(Clone)]
pub struct EvmBalance {
    provider: Provider<Http>,
}

impl EvmBalance {
    pub fn new(provider: Provider<Http>) -> Self {
        Self { provider }
    }

    pub fn connect(rpc_url: &str, request_timeout: Duration) -> Result<Self> {
        Ok(Self::new(http_provider(rpc_url, request_timeout)?))
    }
}

impl BalanceSource for EvmBalance {
    type Error = Error;

    /// Balance in the pending block, net of transfers still in the mempool.
    async fn available_balance(&self, account: &Address) -> Result<Amount> {
        let account = parse_address(account)?;
        let balance = self
            .provider
            .get_balance(account, Some(BlockNumber::Pending.into()))
            .await?;
        from_wei(balance)
    }
}

fn parse_address(address: &Address) -> Result<EvmAddress> {
    EvmAddress::from_str(address.as_str())
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

fn format_address(address: EvmAddress) -> Result<Address> {
    let formatted = format!("{address:#x}");
    Address::new(&formatted).map_err(|_| Error::InvalidAddress(formatted))
}

fn to_wei(amount: Amount) -> U256 {
    U256::from(amount.get())
}

fn from_wei(value: U256) -> Result<Amount> {
    if value > U256::from(u128::MAX) {
        return Err(Error::AmountTooLarge(value));
    }
    Ok(Amount::new(value.as_u128()))
}

/// A receipt in `block` is final once `confirmations` blocks (itself included) are on top.
fn is_final(block: u64, latest: u64, confirmations: u64) -> bool {
    latest >= block.saturating_add(confirmations.saturating_sub(1))
}

/// Nodes only replace a pooled transaction for a higher price; 25% clears every common rule.
fn replacement_gas_price(gas_price: U256) -> U256 {
    (gas_price.saturating_mul(U256::from(5)) / U256::from(4)).saturating_add(U256::one())
}

/// Read a node's error reply to a broadcast.
fn classify_broadcast(message: &str) -> Broadcast {
    let lower = message.to_ascii_lowercase();
    const KNOWN: [&str; 2] = ["already known", "known transaction"];
    // Nothing reached the mempool.
    const NOT_POOLED: [&str; 3] = [
        "connection refused",
        "error trying to connect",
        "transaction underpriced",
    ];
    const REJECTED: [&str; 5] = [
        "insufficient funds",
        "intrinsic gas too low",
        "exceeds block gas limit",
        "invalid sender",
        "execution reverted",
    ];
    if KNOWN.iter().any(|needle| lower.contains(needle)) {
        Broadcast::Known
    } else if lower.contains("nonce too low") {
        Broadcast::NonceUsed
    } else if REJECTED.iter().any(|needle| lower.contains(needle)) {
        Broadcast::Refused(TransferError::Rejected(message.to_string()))
    } else if NOT_POOLED.iter().any(|needle| lower.contains(needle)) {
        Broadcast::Refused(TransferError::Transient(message.to_string()))
    } else {
        Broadcast::Unknown(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::{
        collections::{HashSet, VecDeque},
        net::SocketAddr,
        sync::Mutex as StdMutex,
    };

    // Well-known development key (account 0 of the default test mnemonic).
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn config(rpc_url: &str, request_timeout: Duration) -> EvmTransferConfig {
        EvmTransferConfig {
            rpc_url: rpc_url.to_string(),
            private_key: DEV_KEY.to_string(),
            chain_id: 31337,
            confirmations: 1,
            poll_interval: Duration::from_millis(100),
            request_timeout,
        }
    }

    fn recipient(last: &str) -> Address {
        Address::new(format!("0x{last:0>40}")).unwrap()
    }

    /// JSON-RPC node answering just enough to sign and broadcast transfers.
    #[derive(Default)]
    struct FakeNode {
        delay: Duration,
        /// Error messages for the next broadcasts, in order.
        send_errors: StdMutex<VecDeque<&'static str>>,
        raw_sent: StdMutex<Vec<String>>,
        balance_params: StdMutex<Vec<Value>>,
    }

    impl FakeNode {
        fn failing_sends(errors: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                send_errors: StdMutex::new(errors.iter().copied().collect()),
                ..Default::default()
            })
        }

        fn raw_sent(&self) -> Vec<String> {
            self.raw_sent.lock().unwrap().clone()
        }
    }

    fn hash_of(raw: &str) -> String {
        let bytes = Bytes::from_str(raw).unwrap();
        format!("{:#x}", H256::from(ethers::utils::keccak256(&bytes)))
    }

    async fn rpc_handler(
        State(node): State<Arc<FakeNode>>,
        Json(request): Json<Value>,
    ) -> Json<Value> {
        tokio::time::sleep(node.delay).await;
        let params = &request["params"];
        let result = match request["method"].as_str().unwrap_or_default() {
            "eth_getTransactionCount" => Ok(json!("0x0")),
            "eth_gasPrice" => Ok(json!("0x3b9aca00")),
            "eth_estimateGas" => Ok(json!("0x5208")),
            "eth_getBalance" => {
                node.balance_params.lock().unwrap().push(params.clone());
                Ok(json!("0x64"))
            }
            "eth_sendRawTransaction" => {
                let raw = params[0].as_str().unwrap_or_default().to_string();
                node.raw_sent.lock().unwrap().push(raw.clone());
                let error = node.send_errors.lock().unwrap().pop_front();
                match error {
                    Some(message) => Err(message),
                    None => Ok(json!(hash_of(&raw))),
                }
            }
            _ => Err("method not found"),
        };
        let id = request["id"].clone();
        Json(match result {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32000, "message": message }
            }),
        })
    }

    async fn serve_node(node: Arc<FakeNode>) -> (String, tokio::task::JoinHandle<()>) {
        let router = Router::new()
            .route("/", post(rpc_handler))
            .with_state(node);
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn broadcast_errors_are_classified() {
        assert_eq!(
            classify_broadcast("(code: -32000, message: already known, data: None)"),
            Broadcast::Known
        );
        assert_eq!(classify_broadcast("nonce too low"), Broadcast::NonceUsed);
        assert!(matches!(
            classify_broadcast("(code: -32000) Replacement transaction underpriced"),
            Broadcast::Refused(TransferError::Transient(_))
        ));
        assert!(matches!(
            classify_broadcast("error sending request: connection refused"),
            Broadcast::Refused(TransferError::Transient(_))
        ));
        assert!(matches!(
            classify_broadcast("insufficient funds for gas * price + value"),
            Broadcast::Refused(TransferError::Rejected(_))
        ));
        assert!(matches!(
            classify_broadcast("(code: -32000, message: request timed out, data: None)"),
            Broadcast::Unknown(_)
        ));
        assert!(matches!(
            classify_broadcast("error decoding response body"),
            Broadcast::Unknown(_)
        ));
    }

    #[test]
    fn replacement_outbids_the_earlier_price() {
        assert_eq!(replacement_gas_price(U256::from(100)), U256::from(126));
        assert!(replacement_gas_price(U256::zero()) > U256::zero());
    }

    #[test]
    fn finality_counts_the_inclusion_block() {
        assert!(is_final(100, 100, 1));
        assert!(is_final(100, 100, 0));
        assert!(!is_final(100, 100, 3));
        assert!(is_final(100, 102, 3));
    }

    #[test]
    fn wei_conversion_is_exact() {
        let amount = Amount::new(1_500_000_000_000_000_000);
        assert_eq!(from_wei(to_wei(amount)).unwrap(), amount);
        assert!(matches!(
            from_wei(U256::from(u128::MAX) + U256::one()),
            Err(Error::AmountTooLarge(_))
        ));
    }

    #[test]
    fn addresses_round_trip() {
        let address = Address::new("0x00000000000000000000000000000000000000aa").unwrap();
        let parsed = parse_address(&address).unwrap();
        assert_eq!(format_address(parsed).unwrap(), address);
        assert!(parse_address(&Address::new("0xAA").unwrap()).is_err());
    }

    #[test]
    fn connect_derives_payer_from_key() {
        let transfer =
            EvmTransfer::connect(config("http://127.0.0.1:8545", Duration::from_secs(5))).unwrap();
        assert_eq!(
            transfer.payer().as_str(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );

        let bad = EvmTransfer::connect(EvmTransferConfig {
            private_key: "not-a-key".to_string(),
            ..config("http://127.0.0.1:8545", Duration::from_secs(5))
        });
        assert!(matches!(bad, Err(Error::InvalidPrivateKey(_))));
        assert!(matches!(
            EvmTransfer::connect(config("not a url", Duration::from_secs(5))),
            Err(Error::Url(_))
        ));
    }

    #[tokio::test]
    async fn submit_rejects_foreign_payer_without_rpc() {
        let transfer =
            EvmTransfer::connect(config("http://127.0.0.1:1", Duration::from_secs(5))).unwrap();
        let other = recipient("bb");
        let err = transfer
            .submit_transfer(&other, &other, Amount::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Rejected(_)));
    }

    #[tokio::test]
    async fn timed_out_broadcast_is_resent_unchanged() {
        let node = FakeNode::failing_sends(&["request timed out"]);
        let (url, server) = serve_node(node.clone()).await;
        let transfer = EvmTransfer::connect(config(&url, Duration::from_secs(5))).unwrap();
        let payer = transfer.payer();
        let to = recipient("bb");

        let err = transfer
            .submit_transfer(&payer, &to, Amount::new(1_000))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        let handle = transfer
            .submit_transfer(&payer, &to, Amount::new(1_000))
            .await
            .unwrap();

        let sent = node.raw_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent.iter().collect::<HashSet<_>>().len(), 1);
        assert_eq!(handle.transaction_ref, hash_of(&sent[0]));

        // The next payout takes the following nonce.
        transfer
            .submit_transfer(&payer, &recipient("cc"), Amount::new(1_000))
            .await
            .unwrap();
        assert_eq!(node.raw_sent().iter().collect::<HashSet<_>>().len(), 2);
        server.abort();
    }

    #[tokio::test]
    async fn known_transaction_counts_as_acknowledged() {
        let node = FakeNode::failing_sends(&["request timed out", "already known"]);
        let (url, server) = serve_node(node.clone()).await;
        let transfer = EvmTransfer::connect(config(&url, Duration::from_secs(5))).unwrap();
        let payer = transfer.payer();
        let to = recipient("bb");

        assert!(transfer
            .submit_transfer(&payer, &to, Amount::new(7))
            .await
            .is_err());
        let handle = transfer
            .submit_transfer(&payer, &to, Amount::new(7))
            .await
            .unwrap();
        let sent = node.raw_sent();
        assert_eq!(sent.iter().collect::<HashSet<_>>().len(), 1);
        assert_eq!(handle.transaction_ref, hash_of(&sent[0]));
        server.abort();
    }

    #[tokio::test]
    async fn other_payout_replaces_an_unacknowledged_transfer() {
        let node = FakeNode::failing_sends(&["request timed out", "request timed out"]);
        let (url, server) = serve_node(node.clone()).await;
        let transfer = EvmTransfer::connect(config(&url, Duration::from_secs(5))).unwrap();
        let payer = transfer.payer();

        assert!(transfer
            .submit_transfer(&payer, &recipient("bb"), Amount::new(7))
            .await
            .is_err());
        let earlier = transfer.inner.state.lock().await.unacknowledged.clone().unwrap();

        assert!(transfer
            .submit_transfer(&payer, &recipient("cc"), Amount::new(9))
            .await
            .is_err());
        let replacement = transfer.inner.state.lock().await.unacknowledged.clone().unwrap();
        assert_eq!(replacement.nonce, earlier.nonce);
        assert!(replacement.gas_price > earlier.gas_price);
        assert_ne!(replacement.hash, earlier.hash);
        server.abort();
    }

    #[tokio::test]
    async fn balance_is_read_from_the_pending_block() {
        let node = Arc::new(FakeNode::default());
        let (url, server) = serve_node(node.clone()).await;
        let balances = EvmBalance::connect(&url, Duration::from_secs(5)).unwrap();

        let balance = balances.available_balance(&recipient("aa")).await.unwrap();
        assert_eq!(balance, Amount::new(100));
        let params = node.balance_params.lock().unwrap().clone();
        assert_eq!(params[0][1], "pending");
        server.abort();
    }

    #[tokio::test]
    async fn slow_node_requests_time_out() {
        let node = Arc::new(FakeNode {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let (url, server) = serve_node(node).await;
        let timeout = Duration::from_millis(200);
        let transfer = EvmTransfer::connect(config(&url, timeout)).unwrap();
        let balances = EvmBalance::connect(&url, timeout).unwrap();
        let payer = transfer.payer();

        let submitted = tokio::time::timeout(
            Duration::from_secs(2),
            transfer.submit_transfer(&payer, &recipient("bb"), Amount::new(1)),
        )
        .await
        .expect("submission should give up on its own");
        assert!(submitted.unwrap_err().is_transient());

        let balance = tokio::time::timeout(
            Duration::from_secs(2),
            balances.available_balance(&payer),
        )
        .await
        .expect("balance lookup should give up on its own");
        assert!(balance.is_err());
        server.abort();
    }
}
