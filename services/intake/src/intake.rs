use crate::counter_store::{CounterError, CounterStore, UserSlot};
use crate::storage_layout::{StorageLayout, UserId};
use crate::transform::PhotoTransform;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Why a photo was not stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The user already has the maximum number of photos
    LimitReached,
    /// The photo could not be decoded or re-encoded
    TransformFailed,
    /// The namespace or the photo file could not be written
    StorageFault,
    /// The reservation protocol was misused
    Internal,
}

/// Terminal state of one photo event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted { sequence_number: u32, remaining: u32 },
    Rejected { reason: RejectReason },
}

impl Outcome {
    fn rejected(reason: RejectReason) -> Self {
        Outcome::Rejected { reason }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Accepted { .. } => "accepted",
            Outcome::Rejected { reason } => match reason {
                RejectReason::LimitReached => "limit_reached",
                RejectReason::TransformFailed => "transform_failed",
                RejectReason::StorageFault => "storage_fault",
                RejectReason::Internal => "internal",
            },
        }
    }
}

/// Accept/reject decision and write for incoming photos.
///
/// Per photo: reserve a sequence number under the user's lock, transform,
/// write, then commit or release the reservation. The lock is held from the
/// reservation until the reservation is settled, so concurrent deliveries for
/// one user are serialized while different users run in parallel.
pub struct IntakePipeline {
    layout: StorageLayout,
    counters: Arc<CounterStore>,
    transform: Arc<dyn PhotoTransform>,
    photo_limit: u32,
    transform_timeout: Duration,
}

impl IntakePipeline {
    pub fn new(
        layout: StorageLayout,
        counters: Arc<CounterStore>,
        transform: Arc<dyn PhotoTransform>,
        photo_limit: u32,
        transform_timeout: Duration,
    ) -> Self {
        Self {
            layout,
            counters,
            transform,
            photo_limit,
            transform_timeout,
        }
    }

    pub fn photo_limit(&self) -> u32 {
        self.photo_limit
    }

    /// Process one photo event for `user_id`
    #[instrument(skip(self, raw_bytes), fields(user_id = %user_id, size_bytes = raw_bytes.len()))]
    pub async fn handle_photo(&self, user_id: UserId, raw_bytes: Vec<u8>) -> Outcome {
        let outcome = self.process(user_id, raw_bytes).await;
        metrics::counter!("intake_photos_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn process(&self, user_id: UserId, raw_bytes: Vec<u8>) -> Outcome {
        if let Err(e) = self.layout.ensure_namespace(user_id).await {
            error!(error = %e, "Cannot create user namespace");
            return Outcome::rejected(RejectReason::StorageFault);
        }

        let mut slot = match self.counters.lock(user_id).await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "Cannot load photo counter");
                return Outcome::rejected(RejectReason::StorageFault);
            }
        };

        let sequence_number = match slot.try_reserve_slot(self.photo_limit) {
            Ok(n) => n,
            Err(CounterError::QuotaExceeded { limit }) => {
                info!(limit = limit, "Photo rejected, limit reached");
                return Outcome::rejected(RejectReason::LimitReached);
            }
            Err(e) => {
                error!(error = %e, "Reservation failed");
                return Outcome::rejected(RejectReason::Internal);
            }
        };

        let transform = self.transform.clone();
        let transformed = tokio::time::timeout(
            self.transform_timeout,
            tokio::task::spawn_blocking(move || transform.apply(&raw_bytes)),
        )
        .await;

        let bytes = match transformed {
            Ok(Ok(Ok(bytes))) => bytes,
            Ok(Ok(Err(e))) => {
                warn!(sequence_number = sequence_number, error = %e, "Transform failed");
                return roll_back(slot, RejectReason::TransformFailed);
            }
            Ok(Err(e)) => {
                error!(sequence_number = sequence_number, error = %e, "Transform task failed");
                return roll_back(slot, RejectReason::TransformFailed);
            }
            Err(_) => {
                warn!(
                    sequence_number = sequence_number,
                    timeout_secs = self.transform_timeout.as_secs(),
                    "Transform timed out"
                );
                return roll_back(slot, RejectReason::TransformFailed);
            }
        };

        // The slot moves into the blocking task so the rename and the
        // commit/release happen together even if this future is dropped.
        let layout = self.layout.clone();
        let settled = tokio::task::spawn_blocking(move || {
            let mut slot = slot;
            let written = layout.write_photo(user_id, sequence_number, &bytes);
            let settlement = match written {
                Ok(_) => slot.commit().map(|_| slot.accepted_count()),
                Err(_) => slot.release_slot().map(|()| slot.accepted_count()),
            };
            (written, settlement)
        })
        .await;

        match settled {
            Ok((Ok(path), Ok(accepted_count))) => {
                let remaining = self.photo_limit.saturating_sub(accepted_count);
                info!(
                    sequence_number = sequence_number,
                    remaining = remaining,
                    path = %path.display(),
                    "Photo accepted"
                );
                Outcome::Accepted {
                    sequence_number,
                    remaining,
                }
            }
            Ok((Err(e), Ok(_))) => {
                error!(sequence_number = sequence_number, error = %e, "Photo write failed, reservation released");
                Outcome::rejected(RejectReason::StorageFault)
            }
            Ok((_, Err(e))) => {
                error!(sequence_number = sequence_number, error = %e, "Reservation could not be settled");
                Outcome::rejected(RejectReason::Internal)
            }
            Err(e) => {
                // The slot was dropped inside the task, which rolled it back.
                error!(sequence_number = sequence_number, error = %e, "Write task failed");
                Outcome::rejected(RejectReason::StorageFault)
            }
        }
    }
}

fn roll_back(mut slot: UserSlot, reason: RejectReason) -> Outcome {
    match slot.release_slot() {
        Ok(()) => Outcome::rejected(reason),
        Err(e) => {
            error!(user_id = %slot.user_id(), error = %e, "Rollback failed");
            Outcome::rejected(RejectReason::Internal)
        }
    }
}
