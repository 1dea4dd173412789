//! Engine-wide constants.

/// Confirmations before a coinbase output matures.
pub const COINBASE_MATURITY: i64 = 100;

/// How many blocks below a confirmed match the scanner rewinds to
/// re-verify.  Tunable; see the design notes.
pub const POST_MATCH_REWIND: i64 = 1000;

/// Default upper bound on filters tested per scan tick.
pub const DEFAULT_MAX_SCAN: usize = 10_000;

/// Default distance below the rescan boundary at which a rescan is
/// considered caught up.
pub const DEFAULT_SCAN_THRESHOLD: i64 = 1000;
