use std::env;
use std::str::FromStr;

use tracing::*;

/// Reads an env var, parsing it if set and valid, otherwise returning
/// the provided default.
pub fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(%name, %raw, "unparseable env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}
