use std::sync::atomic::{AtomicU32, Ordering};

/// Status a consumer reports back to its producer.
///
/// Statuses only move forward: `NeedMoreRows` may move to `DrainRequested`
/// or straight to `ConsumerClosed`, and `DrainRequested` may move to
/// `ConsumerClosed`.
#[repr(u32)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display,
)]
pub enum ConsumerStatus {
    /// The consumer accepts rows and metadata.
    #[default]
    #[display(fmt = "NeedMoreRows")]
    NeedMoreRows = 0,
    /// The consumer ignores rows but still accepts metadata.
    #[display(fmt = "DrainRequested")]
    DrainRequested = 1,
    /// The consumer accepts nothing.
    #[display(fmt = "ConsumerClosed")]
    ConsumerClosed = 2,
}

impl ConsumerStatus {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => ConsumerStatus::NeedMoreRows,
            1 => ConsumerStatus::DrainRequested,
            _ => ConsumerStatus::ConsumerClosed,
        }
    }

    /// The most permissive of two statuses.
    pub fn most_permissive(self, other: Self) -> Self {
        self.min(other)
    }
}

/// A [ConsumerStatus] that can be observed and advanced concurrently.
#[derive(Debug, Default)]
pub struct AtomicConsumerStatus(AtomicU32);

impl AtomicConsumerStatus {
    pub fn new(status: ConsumerStatus) -> Self {
        Self(AtomicU32::new(status as u32))
    }

    pub fn load(&self) -> ConsumerStatus {
        ConsumerStatus::from_u32(self.0.load(Ordering::Acquire))
    }

    /// Moves the status forward to `status` unless it is already further.
    ///
    /// Returns the previous status.
    pub fn advance(&self, status: ConsumerStatus) -> ConsumerStatus {
        ConsumerStatus::from_u32(self.0.fetch_max(status as u32, Ordering::AcqRel))
    }

    /// Sets the status to `new` only if it is currently `current`.
    pub fn compare_exchange(
        &self,
        current: ConsumerStatus,
        new: ConsumerStatus,
    ) -> Result<ConsumerStatus, ConsumerStatus> {
        debug_assert!(current <= new, "status must not move backwards");
        self.0
            .compare_exchange(
                current as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(ConsumerStatus::from_u32)
            .map_err(ConsumerStatus::from_u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let status = AtomicConsumerStatus::default();
        assert_eq!(
            status.advance(ConsumerStatus::ConsumerClosed),
            ConsumerStatus::NeedMoreRows
        );
        assert_eq!(
            status.advance(ConsumerStatus::DrainRequested),
            ConsumerStatus::ConsumerClosed
        );
        assert_eq!(status.load(), ConsumerStatus::ConsumerClosed);
    }

    #[test]
    fn test_compare_exchange() {
        let status = AtomicConsumerStatus::new(ConsumerStatus::DrainRequested);
        assert_eq!(
            status.compare_exchange(ConsumerStatus::NeedMoreRows, ConsumerStatus::DrainRequested),
            Err(ConsumerStatus::DrainRequested)
        );
        assert!(status
            .compare_exchange(ConsumerStatus::DrainRequested, ConsumerStatus::ConsumerClosed)
            .is_ok());
    }

    #[test]
    fn test_most_permissive() {
        assert_eq!(
            ConsumerStatus::ConsumerClosed.most_permissive(ConsumerStatus::DrainRequested),
            ConsumerStatus::DrainRequested
        );
    }
}
