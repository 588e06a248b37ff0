//! Production collaborators for the prizeline settlement engine.
//!
//! - [EvmTransfer]: native-asset transfers from a local signing key, with a local nonce
//!   tracker and receipt polling.
//! - [EvmBalance]: payer balance lookups.
//! - [HttpStandings]: final standings from the tournament backend.

pub mod evm;
pub mod standings;

pub use evm::{EvmBalance, EvmTransfer, EvmTransferConfig};
pub use standings::HttpStandings;

use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("no final standings for tournament {0}")]
    StandingsNotFound(u64),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("provider error: {0}")]
    Provider(#[from] ethers::providers::ProviderError),
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("invalid EVM address: {0}")]
    InvalidAddress(String),
    #[error("balance {0} does not fit in an amount")]
    AmountTooLarge(ethers::types::U256),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
