//! Discovery-API address update scheduling.
//!
//! Only one update may be in flight. A request made while one is pending
//! sets a redo flag instead of cancelling anything: the stale result is
//! discarded on completion and the update re-runs immediately.

use std::time::Duration;

use tracing::debug;

/// Fixed retry delay after a failed update with nothing newer pending.
pub const ADDRESS_UPDATE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// What to do after an update completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFollowUp {
    /// Nothing; the update stands.
    None,
    /// Newer data arrived while the update was in flight: re-send now.
    Immediate,
    /// The update failed: re-send after the fixed delay.
    RetryAfter(Duration),
}

/// Tracks the in-flight/redo state of discovery-API address updates.
#[derive(Debug, Default)]
pub struct AddressUpdater {
    in_flight: bool,
    redo: bool,
}

impl AddressUpdater {
    /// Create an idle updater.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask to send an update. Returns true if the caller should start one
    /// now; otherwise the running update is flagged for redo.
    pub fn request(&mut self) -> bool {
        if self.in_flight {
            debug!("address update already in flight, flagging redo");
            self.redo = true;
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    /// Record completion of the in-flight update.
    pub fn completed(&mut self, success: bool) -> UpdateFollowUp {
        self.in_flight = false;

        if self.redo {
            // newer data superseded this update; its result no longer matters
            self.redo = false;
            self.in_flight = true;
            return UpdateFollowUp::Immediate;
        }

        if success {
            UpdateFollowUp::None
        } else {
            UpdateFollowUp::RetryAfter(ADDRESS_UPDATE_RETRY_DELAY)
        }
    }

    /// Whether an update is currently in flight.
    #[must_use]
    pub const fn in_flight(&self) -> bool {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_starts_immediately() {
        let mut updater = AddressUpdater::new();
        assert!(updater.request());
        assert!(updater.in_flight());
    }

    #[test]
    fn concurrent_request_sets_redo() {
        let mut updater = AddressUpdater::new();
        assert!(updater.request());
        assert!(!updater.request());

        // success result is discarded, the superseding update runs now
        assert_eq!(updater.completed(true), UpdateFollowUp::Immediate);
        assert!(updater.in_flight());
    }

    #[test]
    fn redo_applies_even_when_the_stale_update_failed() {
        let mut updater = AddressUpdater::new();
        updater.request();
        updater.request();
        assert_eq!(updater.completed(false), UpdateFollowUp::Immediate);
    }

    #[test]
    fn failure_without_redo_retries_after_fixed_delay() {
        let mut updater = AddressUpdater::new();
        updater.request();
        assert_eq!(
            updater.completed(false),
            UpdateFollowUp::RetryAfter(ADDRESS_UPDATE_RETRY_DELAY)
        );
        assert!(!updater.in_flight());
    }

    #[test]
    fn success_without_redo_is_done() {
        let mut updater = AddressUpdater::new();
        updater.request();
        assert_eq!(updater.completed(true), UpdateFollowUp::None);
        assert!(updater.request());
    }
}
