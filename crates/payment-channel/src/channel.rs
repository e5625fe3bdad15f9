//! The payment channel state machine.
//!
//! A channel escrows one ERC-1155 token id for a `sender` and releases it
//! to a `receiver` against a sender-signed EIP-712 authorization:
//!
//! ```text
//! Uninitialized --initialize--> Active --close | cancel--> Settling --paid--> Settled
//!                                  ^                          |
//!                                  +----- ledger failure -----+
//! ```
//!
//! `Settling` is held only while the ledger disbursement runs. Callers that
//! observe it get [`ChannelError::SettlementInProgress`], never a terminal
//! error for a settlement that may still be rolled back.
//!
//! Escrow is never cached: the balance is read from the ledger at
//! settlement time, so deposits are plain ledger transfers into the
//! channel's address.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::eip712::verify_payment_signature;
use crate::error::ChannelError;
use crate::events::{ChannelEvent, EventLog};
use crate::ledger::{Payout, TokenLedger, TokenReceiver, ERC1155_RECEIVED};
use crate::ChainConfig;

/// Ledger contract plus the token id held in escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRef {
    pub contract: Address,
    pub id: U256,
}

/// Parameters fixed at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTerms {
    pub sender: Address,
    pub receiver: Address,
    pub token: TokenRef,
    /// Unix timestamp (seconds) from which the channel can be canceled
    /// and can no longer be closed.
    pub expiration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Uninitialized,
    Active,
    /// A `close` or `cancel` is paying out; resolves to `Settled` or back
    /// to `Active`.
    Settling,
    Settled,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Uninitialized => write!(f, "Uninitialized"),
            ChannelStatus::Active => write!(f, "Active"),
            ChannelStatus::Settling => write!(f, "Settling"),
            ChannelStatus::Settled => write!(f, "Settled"),
        }
    }
}

const ACTIVE: u8 = 0;
const SETTLING: u8 = 1;
const SETTLED: u8 = 2;

/// A single escrow relationship between one sender and one receiver.
pub struct PaymentChannel<L> {
    address: Address,
    config: ChainConfig,
    ledger: Arc<L>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventLog>,
    /// Set exactly once by `initialize`.
    terms: OnceLock<ChannelTerms>,
    /// ACTIVE -> SETTLING before any funds leave the channel, then SETTLED
    /// on success or back to ACTIVE if the ledger rejects the disbursement.
    settlement: AtomicU8,
}

impl<L: TokenLedger> PaymentChannel<L> {
    /// Build an uninitialized channel at `address`. Only the factory does
    /// this, immediately followed by [`initialize`](Self::initialize).
    pub(crate) fn new(
        address: Address,
        config: ChainConfig,
        ledger: Arc<L>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            address,
            config,
            ledger,
            clock,
            events,
            terms: OnceLock::new(),
            settlement: AtomicU8::new(ACTIVE),
        }
    }

    /// Fix the channel's terms and make it active.
    ///
    /// # Errors
    ///
    /// [`ChannelError::AlreadyInitialized`] on every call after the first;
    /// the original terms are left untouched.
    pub fn initialize(&self, terms: ChannelTerms) -> Result<(), ChannelError> {
        let sender = terms.sender;
        let receiver = terms.receiver;
        let expiration = terms.expiration;

        self.terms
            .set(terms)
            .map_err(|_| ChannelError::AlreadyInitialized)?;

        tracing::info!(
            channel = %self.address,
            sender = %sender,
            receiver = %receiver,
            expiration,
            "channel initialized"
        );
        Ok(())
    }

    /// Settle in favour of the receiver.
    ///
    /// Pays `amount` to the receiver and whatever else is escrowed back to
    /// the sender. Checks run in order: signature over `amount` by the
    /// sender, caller is the receiver, channel not expired, `amount` covered
    /// by escrow. Nothing moves unless all of them pass.
    pub fn close(
        &self,
        caller: Address,
        amount: U256,
        signature: &[u8],
    ) -> Result<(), ChannelError> {
        let terms = self.active_terms()?;

        if let Err(e) =
            verify_payment_signature(&self.config, self.address, amount, signature, terms.sender)
        {
            tracing::warn!(
                channel = %self.address,
                caller = %caller,
                amount = %amount,
                error = %e,
                "close rejected: invalid signature"
            );
            return Err(ChannelError::InvalidSignature(e));
        }

        if caller != terms.receiver {
            tracing::warn!(channel = %self.address, caller = %caller, "close rejected: caller is not receiver");
            return Err(ChannelError::CallerNotReceiver { caller });
        }

        let now = self.clock.now();
        if now >= terms.expiration {
            return Err(ChannelError::PaymentExpired {
                now,
                expiration: terms.expiration,
            });
        }

        let escrow = self.settle(terms, |escrow| {
            if amount > escrow {
                return Err(ChannelError::InsufficientEscrow {
                    requested: amount,
                    available: escrow,
                });
            }
            Ok(vec![
                Payout::new(terms.receiver, amount),
                Payout::new(terms.sender, escrow - amount),
            ])
        })?;

        self.emit(ChannelEvent::PaymentClosed {
            channel: self.address,
            amount,
        });
        tracing::info!(
            channel = %self.address,
            amount = %amount,
            refunded = %(escrow - amount),
            "payment channel closed"
        );
        Ok(())
    }

    /// Return the full escrow to the sender once the channel has expired.
    pub fn cancel(&self, caller: Address) -> Result<(), ChannelError> {
        let terms = self.active_terms()?;

        if caller != terms.sender {
            tracing::warn!(channel = %self.address, caller = %caller, "cancel rejected: caller is not sender");
            return Err(ChannelError::CallerNotSender { caller });
        }

        let now = self.clock.now();
        if now < terms.expiration {
            return Err(ChannelError::NotYetExpired {
                now,
                expiration: terms.expiration,
            });
        }

        let escrow = self.settle(terms, |escrow| Ok(vec![Payout::new(terms.sender, escrow)]))?;

        self.emit(ChannelEvent::PaymentCanceled {
            channel: self.address,
        });
        tracing::info!(channel = %self.address, refunded = %escrow, "payment channel canceled");
        Ok(())
    }

    /// Current escrow, read live from the ledger.
    pub fn escrow_balance(&self) -> Result<U256, ChannelError> {
        let terms = self.terms.get().ok_or(ChannelError::NotInitialized)?;
        self.ledger
            .balance_of(self.address, terms.token.id)
            .map_err(ChannelError::Ledger)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn terms(&self) -> Option<&ChannelTerms> {
        self.terms.get()
    }

    pub fn status(&self) -> ChannelStatus {
        if self.terms.get().is_none() {
            return ChannelStatus::Uninitialized;
        }
        match self.settlement.load(Ordering::SeqCst) {
            SETTLING => ChannelStatus::Settling,
            SETTLED => ChannelStatus::Settled,
            _ => ChannelStatus::Active,
        }
    }

    pub fn chain_config(&self) -> &ChainConfig {
        &self.config
    }

    fn active_terms(&self) -> Result<&ChannelTerms, ChannelError> {
        let terms = self.terms.get().ok_or(ChannelError::NotInitialized)?;
        match self.settlement.load(Ordering::SeqCst) {
            ACTIVE => Ok(terms),
            state => Err(Self::busy_or_settled(state)),
        }
    }

    fn busy_or_settled(state: u8) -> ChannelError {
        if state == SETTLING {
            ChannelError::SettlementInProgress
        } else {
            ChannelError::AlreadySettled
        }
    }

    /// Claim the settlement, then pay out the legs `plan` derives from the
    /// current escrow. Any failure after the claim releases it again, so the
    /// channel is either settled with every leg paid or still active with
    /// nothing moved. Returns the escrow that was paid out.
    ///
    /// The claim happens before the ledger is touched: a receiver hook that
    /// re-enters `close` or `cancel`, or a concurrent caller, sees
    /// `SettlementInProgress` until the outcome is known.
    fn settle<F>(&self, terms: &ChannelTerms, plan: F) -> Result<U256, ChannelError>
    where
        F: FnOnce(U256) -> Result<Vec<Payout>, ChannelError>,
    {
        if let Err(state) = self.settlement.compare_exchange(
            ACTIVE,
            SETTLING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(Self::busy_or_settled(state));
        }

        match self.disburse_escrow(terms, plan) {
            Ok(escrow) => {
                self.settlement.store(SETTLED, Ordering::SeqCst);
                Ok(escrow)
            }
            Err(e) => {
                self.settlement.store(ACTIVE, Ordering::SeqCst);
                tracing::warn!(channel = %self.address, error = %e, "settlement rolled back");
                Err(e)
            }
        }
    }

    fn disburse_escrow<F>(&self, terms: &ChannelTerms, plan: F) -> Result<U256, ChannelError>
    where
        F: FnOnce(U256) -> Result<Vec<Payout>, ChannelError>,
    {
        let escrow = self
            .ledger
            .balance_of(self.address, terms.token.id)
            .map_err(ChannelError::Ledger)?;
        let payouts = plan(escrow)?;
        self.ledger
            .disburse(self.address, terms.token.id, &payouts)
            .map_err(ChannelError::LedgerTransferFailed)?;
        Ok(escrow)
    }

    /// Funds have already moved by the time events are written; a failing
    /// log is reported, not unwound.
    fn emit(&self, event: ChannelEvent) {
        let name = event.name();
        if let Err(e) = self.events.append(event) {
            tracing::error!(channel = %self.address, event = name, error = %e, "failed to record channel event");
        }
    }
}

impl<L: TokenLedger> std::fmt::Debug for PaymentChannel<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentChannel")
            .field("address", &self.address)
            .field("terms", &self.terms.get())
            .field("status", &self.status())
            .finish()
    }
}

impl<L: TokenLedger> TokenReceiver for PaymentChannel<L> {
    /// Deposits are always accepted; amounts are only checked at settlement.
    fn on_erc1155_received(
        &self,
        operator: Address,
        from: Address,
        id: U256,
        value: U256,
        _data: &[u8],
    ) -> [u8; 4] {
        tracing::debug!(
            channel = %self.address,
            operator = %operator,
            from = %from,
            id = %id,
            value = %value,
            "deposit received"
        );
        ERC1155_RECEIVED
    }
}
