use std::sync::{Mutex, MutexGuard};

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::EventLogError;

/// Records emitted by the factory and by channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ChannelEvent {
    PaymentChannelCreated {
        channel: Address,
        sender: Address,
        receiver: Address,
    },
    PaymentClosed {
        channel: Address,
        amount: U256,
    },
    PaymentCanceled {
        channel: Address,
    },
}

impl ChannelEvent {
    /// Channel the event belongs to.
    pub fn channel(&self) -> Address {
        match self {
            ChannelEvent::PaymentChannelCreated { channel, .. }
            | ChannelEvent::PaymentClosed { channel, .. }
            | ChannelEvent::PaymentCanceled { channel } => *channel,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::PaymentChannelCreated { .. } => "PaymentChannelCreated",
            ChannelEvent::PaymentClosed { .. } => "PaymentClosed",
            ChannelEvent::PaymentCanceled { .. } => "PaymentCanceled",
        }
    }
}

/// An event together with its position in the log (1-based, gap-free per log).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: ChannelEvent,
}

/// Trait for event storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`) and keep events in
/// append order.
pub trait EventLog: Send + Sync {
    /// Append an event, returning its sequence number.
    fn append(&self, event: ChannelEvent) -> Result<u64, EventLogError>;

    /// Every event in append order.
    fn events(&self) -> Result<Vec<EventRecord>, EventLogError>;

    /// Events for a single channel, in append order.
    fn events_for(&self, channel: Address) -> Result<Vec<EventRecord>, EventLogError> {
        Ok(self
            .events()?
            .into_iter()
            .filter(|r| r.event.channel() == channel)
            .collect())
    }
}

/// In-memory event log. Lost on restart.
#[derive(Default)]
pub struct InMemoryEventLog {
    records: Mutex<Vec<EventRecord>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EventRecord>> {
        match self.records.lock() {
            Ok(r) => r,
            Err(poisoned) => {
                tracing::error!("event log mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl EventLog for InMemoryEventLog {
    fn append(&self, event: ChannelEvent) -> Result<u64, EventLogError> {
        let mut records = self.lock();
        let sequence = records.len() as u64 + 1;
        records.push(EventRecord { sequence, event });
        Ok(sequence)
    }

    fn events(&self) -> Result<Vec<EventRecord>, EventLogError> {
        Ok(self.lock().clone())
    }
}

#[cfg(feature = "full")]
pub use sqlite::SqliteEventLog;

#[cfg(feature = "full")]
mod sqlite {
    use std::sync::{Mutex, MutexGuard};

    use alloy::primitives::Address;

    use super::{ChannelEvent, EventLog, EventRecord};
    use crate::error::EventLogError;

    /// Persistent event log backed by SQLite. Survives restarts.
    pub struct SqliteEventLog {
        conn: Mutex<rusqlite::Connection>,
    }

    impl SqliteEventLog {
        /// Open (or create) an event database at the given path.
        ///
        /// On Unix the file is restricted to 0600, since the log links
        /// participant addresses to payment amounts.
        pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
            let conn = rusqlite::Connection::open(path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS channel_events (
                    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel BLOB NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_channel_events_channel ON channel_events(channel);
                PRAGMA journal_mode=WAL;",
            )?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                {
                    tracing::warn!(
                        path = %path,
                        error = %e,
                        "failed to set event database file permissions to 0600"
                    );
                }
            }

            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
            match self.conn.lock() {
                Ok(c) => c,
                Err(poisoned) => {
                    tracing::error!("event log mutex poisoned, recovering");
                    poisoned.into_inner()
                }
            }
        }

        fn query(
            &self,
            sql: &str,
            params: &[&dyn rusqlite::ToSql],
        ) -> Result<Vec<EventRecord>, EventLogError> {
            let conn = self.lock();
            let mut stmt = conn.prepare(sql).map_err(storage)?;
            let rows = stmt
                .query_map(params, |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(storage)?;

            let mut records = Vec::new();
            for row in rows {
                let (sequence, payload) = row.map_err(storage)?;
                records.push(EventRecord {
                    sequence: sequence as u64,
                    event: serde_json::from_str(&payload)?,
                });
            }
            Ok(records)
        }
    }

    fn storage(e: rusqlite::Error) -> EventLogError {
        EventLogError::Storage(e.to_string())
    }

    fn unix_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    impl EventLog for SqliteEventLog {
        fn append(&self, event: ChannelEvent) -> Result<u64, EventLogError> {
            let payload = serde_json::to_string(&event)?;
            let conn = self.lock();
            conn.execute(
                "INSERT INTO channel_events (channel, kind, payload, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    event.channel().as_slice(),
                    event.name(),
                    payload,
                    unix_now()
                ],
            )
            .map_err(storage)?;
            Ok(conn.last_insert_rowid() as u64)
        }

        fn events(&self) -> Result<Vec<EventRecord>, EventLogError> {
            self.query(
                "SELECT sequence, payload FROM channel_events ORDER BY sequence",
                &[],
            )
        }

        fn events_for(&self, channel: Address) -> Result<Vec<EventRecord>, EventLogError> {
            self.query(
                "SELECT sequence, payload FROM channel_events WHERE channel = ?1 ORDER BY sequence",
                &[&channel.as_slice()],
            )
        }
    }
}
