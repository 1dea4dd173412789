//! Bounded retry helpers for fallible operations.

/// How many times [`retry!`] attempts an operation before giving up.
pub const DEFAULT_MAX_RETRIES: usize = 5;

/// Milliseconds slept between attempts.
pub const DEFAULT_RETRY_SLEEP_MS: u64 = 1000;

/// Retries a fallible expression with explicit bounds, sleeping between
/// attempts on the current thread.  Evaluates to the final `Result`.
#[macro_export]
macro_rules! retry_with {
    ($max_retries:expr, $sleep_ms:expr, $retriable:expr) => {{
        let mut attempts = 0;
        loop {
            match $retriable {
                Ok(val) => break Ok(val),
                Err(err) => {
                    attempts += 1;
                    if attempts >= $max_retries {
                        break Err(err);
                    }
                    ::std::thread::sleep(::core::time::Duration::from_millis($sleep_ms));
                }
            }
        }
    }};
}

/// [`retry_with!`] with the default bounds.
#[macro_export]
macro_rules! retry {
    ($retriable:expr) => {
        $crate::retry_with!(
            $crate::retry::DEFAULT_MAX_RETRIES,
            $crate::retry::DEFAULT_RETRY_SLEEP_MS,
            $retriable
        )
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_retry_gives_up() {
        let mut calls = 0;
        let res: Result<(), &str> = retry_with!(3, 1, {
            calls += 1;
            Err::<(), _>("nope")
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_succeeds_immediately() {
        let res: Result<u32, &str> = retry_with!(3, 1, Ok::<_, &str>(42));
        assert_eq!(res, Ok(42));
    }
}
