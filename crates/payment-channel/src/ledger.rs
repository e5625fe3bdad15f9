//! Token ledger boundary.
//!
//! Channels never hold balances themselves: escrow lives in an external
//! semi-fungible (ERC-1155 style) ledger keyed by `(holder, token id)`.
//! [`TokenLedger`] is the interface a channel is given at construction;
//! [`InMemoryLedger`] is a self-contained implementation with unrestricted
//! minting, used by tests and the demo binary.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, Weak};

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use dashmap::DashMap;

use crate::error::LedgerError;
use crate::IERC1155Receiver;

/// Acknowledgement a receiver must return from `onERC1155Received`
/// (`bytes4(keccak256("onERC1155Received(address,address,uint256,uint256,bytes)"))`).
pub const ERC1155_RECEIVED: [u8; 4] = IERC1155Receiver::onERC1155ReceivedCall::SELECTOR;

/// One leg of a multi-recipient transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    pub to: Address,
    pub amount: U256,
}

impl Payout {
    pub fn new(to: Address, amount: U256) -> Self {
        Self { to, amount }
    }
}

/// Code attached to an account that wants to be notified of incoming tokens.
pub trait TokenReceiver: Send + Sync {
    /// Called before tokens are credited to the receiver. Returning anything
    /// other than [`ERC1155_RECEIVED`] rejects the transfer.
    fn on_erc1155_received(
        &self,
        operator: Address,
        from: Address,
        id: U256,
        value: U256,
        data: &[u8],
    ) -> [u8; 4];
}

/// Interface to the ledger that custodies escrowed tokens.
///
/// Implementations must be thread-safe and must not hold internal locks
/// while invoking receiver hooks: a hook is free to call back into the
/// ledger or into the channel that triggered the transfer.
pub trait TokenLedger: Send + Sync {
    /// Contract address of this ledger.
    fn address(&self) -> Address;

    /// Balance of token `id` held by `holder`.
    fn balance_of(&self, holder: Address, id: U256) -> Result<U256, LedgerError>;

    /// Move `amount` of `id` from `from` to `to`, consulting the receiver hook
    /// registered for `to` (if any). `operator` must be `from`.
    fn safe_transfer_from(
        &self,
        operator: Address,
        from: Address,
        to: Address,
        id: U256,
        amount: U256,
        data: &[u8],
    ) -> Result<(), LedgerError>;

    /// Pay every leg in `payouts` out of `from`'s balance of `id`.
    ///
    /// All-or-nothing: either every leg is credited or no balance changes.
    fn disburse(&self, from: Address, id: U256, payouts: &[Payout]) -> Result<(), LedgerError>;

    /// Attach receiver code to `account`.
    fn register_receiver(&self, account: Address, receiver: Weak<dyn TokenReceiver>);
}

type BalanceKey = (Address, U256);

/// In-memory semi-fungible ledger. Lost on drop.
pub struct InMemoryLedger {
    address: Address,
    balances: Mutex<HashMap<BalanceKey, U256>>,
    receivers: DashMap<Address, Weak<dyn TokenReceiver>>,
}

impl InMemoryLedger {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balances: Mutex::new(HashMap::new()),
            receivers: DashMap::new(),
        }
    }

    /// Create `amount` new units of `id` for `to`. Unrestricted; test and demo use only.
    pub fn mint(&self, to: Address, id: U256, amount: U256) -> Result<(), LedgerError> {
        self.execute(Address::ZERO, None, id, &[Payout::new(to, amount)], &[])?;
        tracing::debug!(to = %to, id = %id, amount = %amount, "minted");
        Ok(())
    }

    fn lock_balances(&self) -> MutexGuard<'_, HashMap<BalanceKey, U256>> {
        match self.balances.lock() {
            Ok(b) => b,
            Err(poisoned) => {
                tracing::error!("ledger balances mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Run the acceptance check for a single credit.
    fn check_acceptance(
        &self,
        operator: Address,
        from: Address,
        id: U256,
        leg: &Payout,
        data: &[u8],
    ) -> Result<(), LedgerError> {
        // Clone the handle out so the map shard is not locked during the hook.
        let hook = match self.receivers.get(&leg.to) {
            Some(entry) => entry.value().clone(),
            None => return Ok(()),
        };
        let receiver = hook
            .upgrade()
            .ok_or(LedgerError::ReceiverGone { account: leg.to })?;

        if receiver.on_erc1155_received(operator, from, id, leg.amount, data) != ERC1155_RECEIVED {
            return Err(LedgerError::ReceiverRejected { account: leg.to });
        }
        Ok(())
    }

    /// Debit `from` (or mint when `None`) and credit every leg.
    ///
    /// Hooks run first without the balance lock held; the balance check is
    /// then repeated under the lock, so a hook that spends the source
    /// balance re-entrantly makes the whole operation fail cleanly.
    fn execute(
        &self,
        operator: Address,
        from: Option<Address>,
        id: U256,
        payouts: &[Payout],
        data: &[u8],
    ) -> Result<(), LedgerError> {
        let legs: Vec<&Payout> = payouts.iter().filter(|p| !p.amount.is_zero()).collect();
        if legs.is_empty() {
            return Ok(());
        }

        let total = legs
            .iter()
            .try_fold(U256::ZERO, |acc, p| acc.checked_add(p.amount))
            .ok_or(LedgerError::Overflow {
                holder: from.unwrap_or(Address::ZERO),
            })?;

        if let Some(from) = from {
            self.require_balance(&self.lock_balances(), from, id, total)?;
        }

        let hook_from = from.unwrap_or(Address::ZERO);
        for leg in &legs {
            self.check_acceptance(operator, hook_from, id, leg, data)?;
        }

        let mut balances = self.lock_balances();
        if let Some(from) = from {
            self.require_balance(&balances, from, id, total)?;
        }

        // Compute every new balance before writing any of them.
        let mut updates: HashMap<BalanceKey, U256> = HashMap::new();
        if let Some(from) = from {
            let current = balances.get(&(from, id)).copied().unwrap_or_default();
            updates.insert((from, id), current - total);
        }
        for leg in &legs {
            let key = (leg.to, id);
            let current = match updates.get(&key) {
                Some(pending) => *pending,
                None => balances.get(&key).copied().unwrap_or_default(),
            };
            let credited = current
                .checked_add(leg.amount)
                .ok_or(LedgerError::Overflow { holder: leg.to })?;
            updates.insert(key, credited);
        }

        balances.extend(updates);
        drop(balances);

        for leg in &legs {
            tracing::debug!(
                from = %hook_from,
                to = %leg.to,
                id = %id,
                amount = %leg.amount,
                "transfer"
            );
        }
        Ok(())
    }

    fn require_balance(
        &self,
        balances: &HashMap<BalanceKey, U256>,
        holder: Address,
        id: U256,
        required: U256,
    ) -> Result<(), LedgerError> {
        let available = balances.get(&(holder, id)).copied().unwrap_or_default();
        if available < required {
            return Err(LedgerError::InsufficientBalance {
                holder,
                id,
                available,
                required,
            });
        }
        Ok(())
    }
}

impl TokenLedger for InMemoryLedger {
    fn address(&self) -> Address {
        self.address
    }

    fn balance_of(&self, holder: Address, id: U256) -> Result<U256, LedgerError> {
        Ok(self
            .lock_balances()
            .get(&(holder, id))
            .copied()
            .unwrap_or_default())
    }

    fn safe_transfer_from(
        &self,
        operator: Address,
        from: Address,
        to: Address,
        id: U256,
        amount: U256,
        data: &[u8],
    ) -> Result<(), LedgerError> {
        if operator != from {
            return Err(LedgerError::Unauthorized { operator, owner: from });
        }
        self.execute(operator, Some(from), id, &[Payout::new(to, amount)], data)
    }

    fn disburse(&self, from: Address, id: U256, payouts: &[Payout]) -> Result<(), LedgerError> {
        self.execute(from, Some(from), id, payouts, &[])
    }

    fn register_receiver(&self, account: Address, receiver: Weak<dyn TokenReceiver>) {
        self.receivers.insert(account, receiver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ID: U256 = U256::from_limbs([1, 0, 0, 0]);

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    struct Acceptor {
        calls: AtomicUsize,
    }

    impl TokenReceiver for Acceptor {
        fn on_erc1155_received(&self, _: Address, _: Address, _: U256, _: U256, _: &[u8]) -> [u8; 4] {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ERC1155_RECEIVED
        }
    }

    struct Rejector;

    impl TokenReceiver for Rejector {
        fn on_erc1155_received(&self, _: Address, _: Address, _: U256, _: U256, _: &[u8]) -> [u8; 4] {
            [0xde, 0xad, 0xbe, 0xef]
        }
    }

    #[test]
    fn selector_matches_erc1155() {
        assert_eq!(ERC1155_RECEIVED, [0xf2, 0x3a, 0x6e, 0x61]);
    }

    #[test]
    fn mint_and_transfer() {
        let ledger = InMemoryLedger::new(addr(0xee));
        ledger.mint(addr(1), ID, U256::from(1000u64)).unwrap();
        ledger
            .safe_transfer_from(addr(1), addr(1), addr(2), ID, U256::from(400u64), &[])
            .unwrap();

        assert_eq!(ledger.balance_of(addr(1), ID).unwrap(), U256::from(600u64));
        assert_eq!(ledger.balance_of(addr(2), ID).unwrap(), U256::from(400u64));
        assert_eq!(ledger.balance_of(addr(2), U256::from(2u64)).unwrap(), U256::ZERO);
    }

    #[test]
    fn transfer_more_than_balance_fails() {
        let ledger = InMemoryLedger::new(addr(0xee));
        ledger.mint(addr(1), ID, U256::from(10u64)).unwrap();
        let err = ledger
            .safe_transfer_from(addr(1), addr(1), addr(2), ID, U256::from(11u64), &[])
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance_of(addr(1), ID).unwrap(), U256::from(10u64));
    }

    #[test]
    fn operator_must_be_owner() {
        let ledger = InMemoryLedger::new(addr(0xee));
        ledger.mint(addr(1), ID, U256::from(10u64)).unwrap();
        let err = ledger
            .safe_transfer_from(addr(3), addr(1), addr(3), ID, U256::from(1u64), &[])
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized { .. }));
    }

    #[test]
    fn receiver_hook_is_consulted() {
        let ledger = InMemoryLedger::new(addr(0xee));
        let acceptor = Arc::new(Acceptor {
            calls: AtomicUsize::new(0),
        });
        let weak = Arc::downgrade(&acceptor) as Weak<dyn TokenReceiver>;
        ledger.register_receiver(addr(9), weak);

        ledger.mint(addr(1), ID, U256::from(5u64)).unwrap();
        ledger
            .safe_transfer_from(addr(1), addr(1), addr(9), ID, U256::from(5u64), &[])
            .unwrap();
        assert_eq!(acceptor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.balance_of(addr(9), ID).unwrap(), U256::from(5u64));
    }

    #[test]
    fn rejecting_receiver_blocks_transfer() {
        let ledger = InMemoryLedger::new(addr(0xee));
        let rejector: Arc<dyn TokenReceiver> = Arc::new(Rejector);
        ledger.register_receiver(addr(9), Arc::downgrade(&rejector));

        ledger.mint(addr(1), ID, U256::from(5u64)).unwrap();
        let err = ledger
            .safe_transfer_from(addr(1), addr(1), addr(9), ID, U256::from(5u64), &[])
            .unwrap_err();
        assert_eq!(err, LedgerError::ReceiverRejected { account: addr(9) });
        assert_eq!(ledger.balance_of(addr(1), ID).unwrap(), U256::from(5u64));
    }

    #[test]
    fn dropped_receiver_is_gone() {
        let ledger = InMemoryLedger::new(addr(0xee));
        let acceptor: Arc<dyn TokenReceiver> = Arc::new(Acceptor {
            calls: AtomicUsize::new(0),
        });
        ledger.register_receiver(addr(9), Arc::downgrade(&acceptor));
        drop(acceptor);

        ledger.mint(addr(1), ID, U256::from(5u64)).unwrap();
        let err = ledger
            .safe_transfer_from(addr(1), addr(1), addr(9), ID, U256::from(1u64), &[])
            .unwrap_err();
        assert_eq!(err, LedgerError::ReceiverGone { account: addr(9) });
    }

    #[test]
    fn disburse_is_all_or_nothing() {
        let ledger = InMemoryLedger::new(addr(0xee));
        let rejector: Arc<dyn TokenReceiver> = Arc::new(Rejector);
        ledger.register_receiver(addr(9), Arc::downgrade(&rejector));
        ledger.mint(addr(1), ID, U256::from(100u64)).unwrap();

        let err = ledger
            .disburse(
                addr(1),
                ID,
                &[
                    Payout::new(addr(2), U256::from(60u64)),
                    Payout::new(addr(9), U256::from(40u64)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::ReceiverRejected { .. }));
        assert_eq!(ledger.balance_of(addr(1), ID).unwrap(), U256::from(100u64));
        assert_eq!(ledger.balance_of(addr(2), ID).unwrap(), U256::ZERO);

        ledger
            .disburse(
                addr(1),
                ID,
                &[
                    Payout::new(addr(2), U256::from(60u64)),
                    Payout::new(addr(3), U256::from(40u64)),
                ],
            )
            .unwrap();
        assert_eq!(ledger.balance_of(addr(1), ID).unwrap(), U256::ZERO);
        assert_eq!(ledger.balance_of(addr(2), ID).unwrap(), U256::from(60u64));
        assert_eq!(ledger.balance_of(addr(3), ID).unwrap(), U256::from(40u64));
    }

    #[test]
    fn disburse_over_balance_moves_nothing() {
        let ledger = InMemoryLedger::new(addr(0xee));
        ledger.mint(addr(1), ID, U256::from(10u64)).unwrap();
        let err = ledger
            .disburse(
                addr(1),
                ID,
                &[
                    Payout::new(addr(2), U256::from(6u64)),
                    Payout::new(addr(3), U256::from(6u64)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance_of(addr(2), ID).unwrap(), U256::ZERO);
    }

    #[test]
    fn mint_overflow_rejected() {
        let ledger = InMemoryLedger::new(addr(0xee));
        ledger.mint(addr(1), ID, U256::MAX).unwrap();
        let err = ledger.mint(addr(1), ID, U256::from(1u64)).unwrap_err();
        assert_eq!(err, LedgerError::Overflow { holder: addr(1) });
    }
}
