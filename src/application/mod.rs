//! Application layer: the services callers talk to.
//!
//! Each service owns its ports behind `Arc<dyn ...>` handles and serializes
//! work per key through [`locks::KeyedLocks`]: per order in the state
//! machine, per wallet in the ledger and payout scheduler. Locks are always
//! taken order first, wallet second. Everything one operation writes goes
//! to storage as a single `UnitOfWork` commit.

pub mod ledger;
pub mod locks;
pub mod marketplace;
pub mod orders;
pub mod payouts;
pub mod timeline;
