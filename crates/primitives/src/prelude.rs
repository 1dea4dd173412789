// Reexports from elsewhere in the crate.

pub use crate::balance::Balance;
pub use crate::block::{BlockPosition, Height};
pub use crate::buf::{Buf20, Buf32, Buf64};
pub use crate::filter::FilterType;
pub use crate::keys::{
    ChildIndex, KeyId, NymId, PatternId, SubaccountId, SubchainIndex, SubchainKind,
};
pub use crate::params::Chain;
pub use crate::tx::Outpoint;
