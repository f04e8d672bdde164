use thiserror::Error;

/// Caller-visible failures of the agent driver.
///
/// The numeric codes are part of the contract with front ends and never change;
/// code 6 is raised by front ends that have no backend URL to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum DriverError {
    #[error("no compatible agent could be opened")]
    OpenFailed = 1,
    #[error("the agent refused to hand over control")]
    Refused = 2,
    #[error("a connection attempt is already pending")]
    PendingOpen = 3,
    #[error("a connection is already open")]
    AlreadyOpen = 4,
    #[error("no connection has been opened")]
    NotOpened = 5,
    #[error("no backend URL is configured")]
    NotConfigured = 6,
    #[error("the agent could not be configured")]
    ConfigFeedFailed = 7,
    #[error("another operation is in flight")]
    DriverBusy = 8,
    #[error("product search failed")]
    SearchFailed = 9,
    #[error("catalog fetch failed")]
    CatalogFetchFailed = 10,
    #[error("history fetch failed")]
    HistoryFetchFailed = 11,
    #[error("performing actions failed")]
    ActionsFailed = 12,
    #[error("invalid action type")]
    InvalidActionType = 13,
}

impl DriverError {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn slug(self) -> &'static str {
        match self {
            Self::OpenFailed => "open-failed",
            Self::Refused => "refused",
            Self::PendingOpen => "pending-open",
            Self::AlreadyOpen => "already-open",
            Self::NotOpened => "not-opened",
            Self::NotConfigured => "not-configured",
            Self::ConfigFeedFailed => "config-feed-failed",
            Self::DriverBusy => "driver-busy",
            Self::SearchFailed => "search-failed",
            Self::CatalogFetchFailed => "catalog-fetch-failed",
            Self::HistoryFetchFailed => "history-fetch-failed",
            Self::ActionsFailed => "actions-failed",
            Self::InvalidActionType => "invalid-action-type",
        }
    }

    /// Hex rendering shown to end users, e.g. `0xc`.
    pub fn hex_code(self) -> String {
        format!("0x{:x}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DriverError::OpenFailed.code(), 1);
        assert_eq!(DriverError::NotConfigured.code(), 6);
        assert_eq!(DriverError::ConfigFeedFailed.code(), 7);
        assert_eq!(DriverError::InvalidActionType.code(), 13);
    }

    #[test]
    fn hex_code_matches_display_format() {
        assert_eq!(DriverError::ActionsFailed.hex_code(), "0xc");
        assert_eq!(DriverError::Refused.hex_code(), "0x2");
    }

    #[test]
    fn slugs_are_kebab_case() {
        assert_eq!(DriverError::DriverBusy.slug(), "driver-busy");
        assert_eq!(DriverError::CatalogFetchFailed.slug(), "catalog-fetch-failed");
    }
}
