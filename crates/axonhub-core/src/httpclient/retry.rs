//! Advisory retry classification. Nothing in this crate retries; callers
//! above the pipeline consult this to decide.

use super::Error;

/// 429 and 5xx are retryable, other 4xx are not, transport failures are.
pub fn should_retry(error: &Error) -> bool {
    match error {
        Error::Status(status) => should_retry_status(status.status_code),
        Error::Transport(_) => true,
        _ => false,
    }
}

pub fn should_retry_status(status_code: u16) -> bool {
    match status_code {
        429 => true,
        400..=499 => false,
        500..=599 => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(should_retry_status(429));
        assert!(should_retry_status(500));
        assert!(should_retry_status(503));
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(401));
        assert!(!should_retry_status(404));
        assert!(!should_retry_status(200));
    }
}
