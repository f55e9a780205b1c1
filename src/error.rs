use std::fmt;

/// A reportable failure for a single line of client input.
///
/// Every variant maps to exactly one wire-level `reason` string (see
/// `reason()`); none of them tear down the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    Utf8,
    Json,
    Malformed,
    Internal,
}

impl BrokerError {
    /// The fixed reason string sent back to the client on this error.
    pub fn reason(&self) -> &'static str {
        match self {
            BrokerError::Utf8 => "Could not decode input as UTF-8",
            BrokerError::Json => "Could not parse json",
            BrokerError::Malformed => "Malformed json message",
            BrokerError::Internal => "Internal exception",
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for BrokerError {}
