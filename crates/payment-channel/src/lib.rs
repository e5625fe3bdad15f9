//! Unidirectional payment channels over an ERC-1155 style token ledger.
//!
//! A sender escrows units of one token id in a channel; the receiver later
//! settles by presenting an EIP-712 signature from the sender over the
//! amount it is owed. If the receiver never settles, the sender reclaims the
//! escrow after the channel expires.
//!
//! # Components
//!
//! - **Factory** ([`PaymentChannelFactory`]): creates, initializes and indexes channels
//! - **Channel** ([`PaymentChannel`]): the escrow state machine (`close`, `cancel`)
//! - **Signature authority** ([`eip712`]): typed-data digests and signer recovery
//! - **Ledger** ([`TokenLedger`]): the external token custody interface
//!
//! # Quick example
//!
//! ```
//! use std::sync::Arc;
//! use alloy::primitives::{Address, U256};
//! use alloy::signers::local::PrivateKeySigner;
//! use payment_channel::{eip712, ChainConfig, InMemoryLedger, PaymentChannelFactory, TokenLedger};
//!
//! let token_id = U256::from(1u64);
//! let ledger = Arc::new(InMemoryLedger::new(Address::repeat_byte(0xee)));
//! let factory = PaymentChannelFactory::new(Address::repeat_byte(0xfa), Arc::clone(&ledger));
//!
//! let sender = PrivateKeySigner::random();
//! let receiver = Address::repeat_byte(0x22);
//! ledger.mint(sender.address(), token_id, U256::from(1000u64)).unwrap();
//!
//! let channel = factory
//!     .create_payment_channel(sender.address(), receiver, u64::MAX, ledger.address(), token_id)
//!     .unwrap();
//! ledger
//!     .safe_transfer_from(sender.address(), sender.address(), channel.address(), token_id, U256::from(1000u64), &[])
//!     .unwrap();
//!
//! let amount = U256::from(500u64);
//! let sig = eip712::sign_payment(&sender, &ChainConfig::default(), channel.address(), amount).unwrap();
//! channel.close(receiver, amount, &sig.as_bytes()).unwrap();
//!
//! assert_eq!(ledger.balance_of(receiver, token_id).unwrap(), amount);
//! ```

pub mod channel;
pub mod clock;
pub mod constants;
pub mod eip712;
pub mod error;
pub mod events;
pub mod factory;
pub mod ledger;

use alloy::sol;

// EIP-712 struct the sender signs. The sol! macro derives SolStruct,
// which provides eip712_signing_hash().
sol! {
    #[derive(Debug)]
    struct Payment {
        uint256 amount;
    }
}

// ERC-1155 receiver hook; only its selector is used, as the acknowledgement
// a receiving contract must return.
sol! {
    interface IERC1155Receiver {
        function onERC1155Received(
            address operator,
            address from,
            uint256 id,
            uint256 value,
            bytes data
        ) external returns (bytes4);
    }
}

// Re-exports
pub use channel::{ChannelStatus, ChannelTerms, PaymentChannel, TokenRef};
pub use clock::{Clock, ManualClock, SystemClock};
pub use constants::*;
pub use error::{ChannelError, ConfigError, EventLogError, FactoryError, LedgerError, SignatureError};
pub use events::{ChannelEvent, EventLog, EventRecord, InMemoryEventLog};
pub use factory::PaymentChannelFactory;
pub use ledger::{InMemoryLedger, Payout, TokenLedger, TokenReceiver, ERC1155_RECEIVED};

#[cfg(feature = "full")]
pub use events::SqliteEventLog;
