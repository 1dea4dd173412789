//! Spend proposal handling: transaction construction, signing, and the
//! pending-proposal manager.

mod builder;
mod proposals;

pub use builder::{BuilderError, TransactionBuilder};
pub use proposals::Proposals;
