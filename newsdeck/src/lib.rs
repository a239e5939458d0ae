/*
newsdeck library crate.
Exposes the feed refresh core so the binary and integration tests share one implementation.
*/

pub mod cache;
pub mod fetcher;
pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod warmer;
