pub mod actor;
pub mod money;
pub mod order;
pub mod package;
pub mod payout;
pub mod ports;
pub mod timeline;
pub mod transaction;
pub mod wallet;
