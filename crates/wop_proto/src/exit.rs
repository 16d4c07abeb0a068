//! Exit-code enumeration shared by the top-level send/claim APIs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitCode {
    Ok = 0,
    Offline = 1,
    Rejected = 2,
    Invalid = 3,
    RateLimited = 4,
    VersionMismatch = 5,
    PeerOffline = 6,
    Unauthorized = 7,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == ExitCode::Ok
    }
}
