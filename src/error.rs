//! Bus error types

use std::fmt;

/// Errors surfaced to callers of the bus facade and broker.
#[derive(Debug)]
pub enum BusError {
    /// Publish topic failed validation
    InvalidTopic(&'static str),
    /// Subscription filter failed validation
    InvalidFilter(&'static str),
    /// Broker is not in the running state
    NotConnected,
    /// Route queue is full (back-pressure policy `drop-and-error`)
    QueueFull,
    /// Deadline elapsed while waiting (connection wait or blocking enqueue)
    Timeout,
    /// JSON serialization failed
    Serialization(serde_json::Error),
    /// Broker lifecycle has already advanced past the initial state
    AlreadyStarted,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
            Self::InvalidFilter(msg) => write!(f, "invalid filter: {}", msg),
            Self::NotConnected => write!(f, "broker is not running"),
            Self::QueueFull => write!(f, "route queue is full"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
            Self::AlreadyStarted => write!(f, "broker has already been started"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e)
    }
}

/// Error returned by a subscriber handler.
///
/// A handler error never reaches the publisher; for QoS >= 1 it drives
/// the dispatcher's retry ladder.
#[derive(Debug, Clone)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler error: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Result type for subscriber handlers
pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            BusError::InvalidTopic("topic name cannot be empty").to_string(),
            "invalid topic: topic name cannot be empty"
        );
        assert_eq!(BusError::NotConnected.to_string(), "broker is not running");
        assert_eq!(
            HandlerError::from("db unavailable").to_string(),
            "handler error: db unavailable"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let bus_err = BusError::from(err);
        assert!(matches!(bus_err, BusError::Serialization(_)));
    }
}
