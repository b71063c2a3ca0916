//! Application layer: the services that orchestrate the domain through its ports.
//!
//! Every balance-changing entry point follows the same shape: take the advisory
//! lock for its business key, open a transaction, re-validate, mutate the balance
//! together with its ledger entry and the owning record, commit, release.

pub mod events;
pub mod invites;
pub mod ledger;
pub mod locking;
pub mod orders;
pub mod portal;
pub mod reconcile;
pub mod sweeper;
pub mod tasks;
