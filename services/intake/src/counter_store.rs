use crate::storage_layout::{StorageError, StorageLayout, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Errors raised by the counter store
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Photo limit of {limit} reached")]
    QuotaExceeded { limit: u32 },

    #[error("No outstanding reservation to {action} for user {user_id}")]
    NoReservation {
        user_id: UserId,
        action: &'static str,
    },

    #[error("Reservation {sequence_number} still outstanding for user {user_id}")]
    ReservationOutstanding { user_id: UserId, sequence_number: u32 },

    #[error("Counter reconciliation failed: {0}")]
    Reconciliation(#[from] StorageError),
}

impl CounterError {
    /// Misuse of the reservation protocol rather than a runtime condition
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            CounterError::NoReservation { .. } | CounterError::ReservationOutstanding { .. }
        )
    }
}

/// Per-user record behind the user's lock
#[derive(Debug, Default)]
struct QuotaRecord {
    reconciled: bool,
    accepted_count: u32,
    /// Never below `accepted_count + 1`; stays past gaps left on disk
    next_sequence: u32,
}

impl QuotaRecord {
    /// Undo the latest reservation; only one is ever outstanding
    fn roll_back(&mut self) {
        self.accepted_count = self.accepted_count.saturating_sub(1);
        self.next_sequence = self.next_sequence.saturating_sub(1).max(1);
    }
}

/// Authoritative count of accepted photos per user.
///
/// Every user has an async mutex of their own; the map of mutexes is only
/// locked long enough to find or insert an entry, so users never contend with
/// each other. The first lock of a user in this process reconciles the count
/// against the files in the user's namespace.
pub struct CounterStore {
    layout: StorageLayout,
    records: Mutex<HashMap<UserId, Arc<AsyncMutex<QuotaRecord>>>>,
}

impl CounterStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire exclusive access to a user's counter
    pub async fn lock(&self, user_id: UserId) -> Result<UserSlot, CounterError> {
        let record = {
            let mut records = self.records.lock();
            records.entry(user_id).or_default().clone()
        };

        let mut guard = record.lock_owned().await;
        if !guard.reconciled {
            self.reconcile(user_id, &mut guard).await?;
        }

        Ok(UserSlot {
            user_id,
            record: guard,
            pending: None,
        })
    }

    /// Current accepted count, reconciling with disk on first access
    pub async fn get(&self, user_id: UserId) -> Result<u32, CounterError> {
        Ok(self.lock(user_id).await?.accepted_count())
    }

    /// Number of users with a record in this process
    pub fn known_users(&self) -> usize {
        self.records.lock().len()
    }

    async fn reconcile(&self, user_id: UserId, record: &mut QuotaRecord) -> Result<(), CounterError> {
        let swept = self.layout.sweep_partial(user_id).await?;
        let scan = self.layout.scan_namespace(user_id).await?;

        record.accepted_count = scan.count;
        record.next_sequence = scan.highest + 1;
        record.reconciled = true;

        if scan.count > 0 || swept > 0 {
            info!(
                user_id = %user_id,
                accepted_count = scan.count,
                next_sequence = record.next_sequence,
                partial_removed = swept,
                "Reconciled photo counter from storage"
            );
        } else {
            debug!(user_id = %user_id, "New quota record");
        }

        Ok(())
    }
}

/// Exclusive handle on one user's counter.
///
/// Holds the user's lock for as long as it lives. At most one reservation is
/// outstanding per handle; a handle dropped with an outstanding reservation
/// rolls it back.
pub struct UserSlot {
    user_id: UserId,
    record: OwnedMutexGuard<QuotaRecord>,
    pending: Option<u32>,
}

impl UserSlot {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Accepted count including an outstanding reservation
    pub fn accepted_count(&self) -> u32 {
        self.record.accepted_count
    }

    /// Claim the next sequence number if the user is below `limit`
    pub fn try_reserve_slot(&mut self, limit: u32) -> Result<u32, CounterError> {
        if let Some(sequence_number) = self.pending {
            return Err(CounterError::ReservationOutstanding {
                user_id: self.user_id,
                sequence_number,
            });
        }

        if self.record.accepted_count >= limit {
            return Err(CounterError::QuotaExceeded { limit });
        }

        let sequence_number = self.record.next_sequence;
        self.record.accepted_count += 1;
        self.record.next_sequence += 1;
        self.pending = Some(sequence_number);
        Ok(sequence_number)
    }

    /// Keep the outstanding reservation; its photo is on disk
    pub fn commit(&mut self) -> Result<u32, CounterError> {
        self.pending.take().ok_or(CounterError::NoReservation {
            user_id: self.user_id,
            action: "commit",
        })
    }

    /// Undo the outstanding reservation
    pub fn release_slot(&mut self) -> Result<(), CounterError> {
        self.pending.take().ok_or(CounterError::NoReservation {
            user_id: self.user_id,
            action: "release",
        })?;
        self.record.roll_back();
        Ok(())
    }
}

impl Drop for UserSlot {
    fn drop(&mut self) {
        if let Some(sequence_number) = self.pending.take() {
            self.record.roll_back();
            warn!(
                user_id = %self.user_id,
                sequence_number = sequence_number,
                "Abandoned reservation rolled back"
            );
        }
    }
}
