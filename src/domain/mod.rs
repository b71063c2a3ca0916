//! Entities, value objects and rules, plus the ports the application layer talks through.

pub mod account;
pub mod ids;
pub mod invite;
pub mod money;
pub mod order;
pub mod payment;
pub mod ports;
pub mod task;
pub mod verify;
