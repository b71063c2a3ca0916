//! Identifier aliases shared across the domain.

pub type UserId = u64;
pub type OrderId = u64;
pub type TaskId = u64;
pub type EntryId = u64;
pub type AdminId = u64;
pub type FeatureId = u64;

/// Token units held on an account. Signed so deltas and balances share a type.
pub type Tokens = i64;
