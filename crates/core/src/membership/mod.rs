//! Group membership reconciliation: diffing and batched writing.

pub mod differ;
pub mod locks;
pub mod writer;

pub use differ::{MembershipDiffer, ReconciliationResult};
pub use locks::GroupLocks;
pub use writer::{BatchedGroupWriter, WriteOutcome};
