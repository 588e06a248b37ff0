//! Default values for optional [crate::Config] fields.

pub const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_CONFIRMATION_POLL_MS: u64 = 2_000;
/// Bound on a single JSON-RPC request to the chain node.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_RECOVERY_PROBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SUBMIT_ATTEMPTS: u32 = 3;
pub const DEFAULT_SUBMIT_BACKOFF_MS: u64 = 500;
pub const DEFAULT_BALANCE_RESERVE: &str = "0";
/// Decimals of the chain's native asset (ether).
pub const DEFAULT_DECIMALS: u32 = 18;
pub const DEFAULT_CONFIRMATIONS: u64 = 1;
pub const DEFAULT_LEDGER_PATH: &str = "prizeline.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const PAYER_PRIVATE_KEY_ENV: &str = "PRIZELINE_PAYER_PRIVATE_KEY";
pub const PAYER_PRIVATE_KEY_FILE_ENV: &str = "PRIZELINE_PAYER_PRIVATE_KEY_FILE";
