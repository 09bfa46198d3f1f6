pub mod accumulator;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod fingerprint;
pub mod liveness;
pub mod metrics;
pub mod parsers;
pub mod reassembler;
pub mod reconcile;
pub mod record;
pub mod retry;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod watchdog;
