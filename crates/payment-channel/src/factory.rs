use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use alloy::primitives::{Address, U256};
use dashmap::DashMap;

use crate::channel::{ChannelTerms, PaymentChannel, TokenRef};
use crate::clock::{Clock, SystemClock};
use crate::error::FactoryError;
use crate::events::{ChannelEvent, EventLog, InMemoryEventLog};
use crate::ledger::{TokenLedger, TokenReceiver};
use crate::ChainConfig;

/// Creates, initializes and indexes payment channels.
///
/// The factory never holds funds. Every channel it creates gets a fresh
/// address derived from the factory address and a creation nonce (the
/// same derivation as contract `CREATE`), is initialized before it is
/// reachable, and is registered with the ledger as a token receiver so it
/// can be funded with safe transfers.
pub struct PaymentChannelFactory<L> {
    address: Address,
    config: ChainConfig,
    ledger: Arc<L>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventLog>,
    /// Next creation nonce. Starts at 1, like a freshly deployed contract.
    nonce: AtomicU64,
    channels: DashMap<Address, Arc<PaymentChannel<L>>>,
}

impl<L: TokenLedger + 'static> PaymentChannelFactory<L> {
    /// Create a factory with local-chain defaults, wall-clock time and an
    /// in-memory event log.
    pub fn new(address: Address, ledger: Arc<L>) -> Self {
        Self {
            address,
            config: ChainConfig::default(),
            ledger,
            clock: Arc::new(SystemClock),
            events: Arc::new(InMemoryEventLog::new()),
            nonce: AtomicU64::new(1),
            channels: DashMap::new(),
        }
    }

    /// Use a custom chain configuration for every channel created afterwards.
    pub fn with_chain_config(mut self, config: ChainConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom time source (e.g. a manual clock in tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set a custom event log (e.g. SqliteEventLog for persistence).
    pub fn with_event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.events = events;
        self
    }

    /// Create and initialize a channel in one step.
    ///
    /// # Errors
    ///
    /// [`FactoryError::UnsupportedToken`] if `token` is not this factory's
    /// ledger. Initialization errors are propagated as
    /// [`FactoryError::Channel`].
    pub fn create_payment_channel(
        &self,
        sender: Address,
        receiver: Address,
        expiration: u64,
        token: Address,
        token_id: U256,
    ) -> Result<Arc<PaymentChannel<L>>, FactoryError> {
        let ledger_address = self.ledger.address();
        if token != ledger_address {
            return Err(FactoryError::UnsupportedToken {
                token,
                ledger: ledger_address,
            });
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let address = self.address.create(nonce);

        let channel = Arc::new(PaymentChannel::new(
            address,
            self.config.clone(),
            Arc::clone(&self.ledger),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
        ));
        channel.initialize(ChannelTerms {
            sender,
            receiver,
            token: TokenRef {
                contract: token,
                id: token_id,
            },
            expiration,
        })?;

        let hook = Arc::downgrade(&channel) as Weak<dyn TokenReceiver>;
        self.ledger.register_receiver(address, hook);
        self.channels.insert(address, Arc::clone(&channel));

        if let Err(e) = self.events.append(ChannelEvent::PaymentChannelCreated {
            channel: address,
            sender,
            receiver,
        }) {
            tracing::error!(channel = %address, error = %e, "failed to record channel creation");
        }

        tracing::info!(
            channel = %address,
            sender = %sender,
            receiver = %receiver,
            token_id = %token_id,
            expiration,
            "payment channel created"
        );
        Ok(channel)
    }

    /// Look up a channel by address.
    pub fn channel(&self, address: Address) -> Option<Arc<PaymentChannel<L>>> {
        self.channels.get(&address).map(|c| Arc::clone(c.value()))
    }

    /// Addresses of every channel funded by `sender`, sorted.
    pub fn channels_by_sender(&self, sender: Address) -> Vec<Address> {
        self.select(|t| t.sender == sender)
    }

    /// Addresses of every channel paying `receiver`, sorted.
    pub fn channels_by_receiver(&self, receiver: Address) -> Vec<Address> {
        self.select(|t| t.receiver == receiver)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.events
    }

    fn select(&self, pred: impl Fn(&ChannelTerms) -> bool) -> Vec<Address> {
        let mut found: Vec<Address> = self
            .channels
            .iter()
            .filter(|entry| entry.value().terms().is_some_and(&pred))
            .map(|entry| *entry.key())
            .collect();
        found.sort();
        found
    }
}
