use std::sync::Arc;

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payment_channel::{
    eip712, ChainConfig, Clock, EventLog, InMemoryEventLog, InMemoryLedger, PaymentChannelFactory,
    SqliteEventLog, SystemClock, TokenLedger,
};

fn env_u256(var: &str, default: u64) -> U256 {
    match std::env::var(var) {
        Ok(val) => val
            .parse::<U256>()
            .unwrap_or_else(|e| panic!("invalid {var} -- must be a valid U256: {e}")),
        Err(_) => U256::from(default),
    }
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ChainConfig::from_env().expect("invalid chain configuration");

    let sender: PrivateKeySigner = match std::env::var("SENDER_PRIVATE_KEY") {
        Ok(key) => key.parse().expect("invalid SENDER_PRIVATE_KEY"),
        Err(_) => {
            tracing::warn!("SENDER_PRIVATE_KEY not set -- using a random throwaway key");
            PrivateKeySigner::random()
        }
    };
    let receiver: Address = std::env::var("RECEIVER_ADDRESS")
        .ok()
        .map(|s| s.parse().expect("invalid RECEIVER_ADDRESS"))
        .unwrap_or_else(|| PrivateKeySigner::random().address());

    let deposit = env_u256("DEPOSIT_AMOUNT", 1000);
    let payment = env_u256("PAYMENT_AMOUNT", 500);
    let token_id = env_u256("TOKEN_ID", 1);
    let expiration_secs: u64 = std::env::var("EXPIRATION_SECS")
        .ok()
        .map(|s| s.parse().expect("invalid EXPIRATION_SECS"))
        .unwrap_or(3600);

    let events: Arc<dyn EventLog> = match std::env::var("EVENT_DB_PATH") {
        Ok(path) => match SqliteEventLog::open(&path) {
            Ok(log) => {
                tracing::info!("Event log: SQLite at {}", path);
                Arc::new(log)
            }
            Err(e) => {
                tracing::error!("Failed to open SQLite event log at {}: {}", path, e);
                std::process::exit(1);
            }
        },
        Err(_) => {
            tracing::info!("Event log: in-memory (set EVENT_DB_PATH to persist)");
            Arc::new(InMemoryEventLog::new())
        }
    };

    // Mock token, then the factory bound to it.
    let ledger = Arc::new(InMemoryLedger::new(Address::repeat_byte(0x11)));
    ledger
        .mint(sender.address(), token_id, deposit)
        .expect("mint failed");

    let clock = Arc::new(SystemClock);
    let factory = PaymentChannelFactory::new(Address::repeat_byte(0xfa), Arc::clone(&ledger))
        .with_chain_config(config.clone())
        .with_clock(clock.clone())
        .with_event_log(Arc::clone(&events));

    let expiration = clock.now().saturating_add(expiration_secs);
    let channel = factory
        .create_payment_channel(
            sender.address(),
            receiver,
            expiration,
            ledger.address(),
            token_id,
        )
        .expect("channel creation failed");

    println!("Payment channel created");
    println!("  Channel:    {}", channel.address());
    println!("  Sender:     {}", sender.address());
    println!("  Receiver:   {receiver}");
    println!("  Chain ID:   {}", config.chain_id);
    println!("  Expiration: {expiration}");

    ledger
        .safe_transfer_from(
            sender.address(),
            sender.address(),
            channel.address(),
            token_id,
            deposit,
            &[],
        )
        .expect("deposit failed");
    println!("\nDeposited {deposit} units of token {token_id}");

    let signature = eip712::sign_payment(&sender, &config, channel.address(), payment)
        .expect("signing failed");
    println!("Signed payment for {payment}");
    println!("  sig: {}", eip712::encode_signature_hex(&signature));

    match channel.close(receiver, payment, &signature.as_bytes()) {
        Ok(()) => println!("Channel closed."),
        Err(e) => {
            eprintln!("ERROR: close failed: {e}");
            std::process::exit(1);
        }
    }

    let balance = |who: Address| ledger.balance_of(who, token_id).expect("balance query failed");
    println!("\nFinal balances");
    println!("  Receiver: {}", balance(receiver));
    println!("  Sender:   {}", balance(sender.address()));
    println!("  Channel:  {}", balance(channel.address()));

    println!("\nEvents");
    for record in events.events().expect("failed to read events") {
        println!(
            "  #{} {}",
            record.sequence,
            serde_json::to_string(&record.event).expect("event serialization failed")
        );
    }
}
