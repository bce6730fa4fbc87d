//! Error taxonomy shared by adapters, the retry controller and the pipeline.

use crate::exchange::Exchange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Classification of a failed exchange interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    Network,
    InsufficientBalance,
    OrderRejected,
    ClockSkew,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::OrderRejected => "order_rejected",
            ErrorKind::ClockSkew => "clock_skew",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Network | ErrorKind::ClockSkew
        )
    }

    /// Failures caused by the user's account or order, not by this system.
    pub fn is_user_error(&self) -> bool {
        matches!(self, ErrorKind::InsufficientBalance | ErrorKind::OrderRejected)
    }

    /// Generic mapping from an HTTP status code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 | 418 => ErrorKind::RateLimit,
            408 | 504 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Network,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "rate_limit" => ErrorKind::RateLimit,
            "timeout" => ErrorKind::Timeout,
            "network" => ErrorKind::Network,
            "insufficient_balance" => ErrorKind::InsufficientBalance,
            "order_rejected" => ErrorKind::OrderRejected,
            "clock_skew" => ErrorKind::ClockSkew,
            "unknown" => ErrorKind::Unknown,
            other => return Err(format!("unknown error kind: {other}")),
        })
    }
}

/// A classified failure from one exchange call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{exchange} {kind}: {message}")]
pub struct ExchangeError {
    pub exchange: Exchange,
    pub kind: ErrorKind,
    pub message: String,
    /// The venue refused a client order id it has already seen.
    pub duplicate_order: bool,
}

impl ExchangeError {
    pub fn new(exchange: Exchange, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            exchange,
            kind,
            message: message.into(),
            duplicate_order: false,
        }
    }

    /// Rejection of a reused idempotency key.
    pub fn duplicate(exchange: Exchange, message: impl Into<String>) -> Self {
        Self {
            duplicate_order: true,
            ..Self::new(exchange, ErrorKind::OrderRejected, message)
        }
    }

    /// Classify a transport-level failure from the HTTP client.
    pub fn from_transport(exchange: Exchange, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            ErrorKind::Network
        } else if let Some(status) = err.status() {
            ErrorKind::from_http_status(status.as_u16())
        } else {
            ErrorKind::Unknown
        };
        Self::new(exchange, kind, err.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Reasons a position could not be sized.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SizingError {
    #[error("available balance {available} is below the required minimum {required}")]
    InsufficientBalance {
        available: rust_decimal::Decimal,
        required: rust_decimal::Decimal,
    },
    #[error("quantity {quantity} is below the exchange minimum for {pair}")]
    BelowMinimum {
        pair: String,
        quantity: rust_decimal::Decimal,
    },
    #[error("invalid price {0}")]
    InvalidPrice(rust_decimal::Decimal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::ClockSkew.is_retryable());
        assert!(!ErrorKind::InsufficientBalance.is_retryable());
        assert!(!ErrorKind::OrderRejected.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
        assert!(ErrorKind::OrderRejected.is_user_error());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorKind::from_http_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_http_status(504), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_http_status(502), ErrorKind::Network);
        assert_eq!(ErrorKind::from_http_status(400), ErrorKind::Unknown);
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [ErrorKind::RateLimit, ErrorKind::ClockSkew, ErrorKind::Unknown] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_duplicate_is_order_rejected() {
        let err = ExchangeError::duplicate(Exchange::Binance, "Duplicate order sent.");
        assert_eq!(err.kind, ErrorKind::OrderRejected);
        assert!(err.duplicate_order);
        assert!(!err.is_retryable());
    }
}
