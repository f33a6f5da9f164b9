// Warden Kernel
//
// Replication core for policy administration: a single writer appends
// adjudicated policy mutations to an event log, and every node replays that
// log into its own policy store behind revision-based consistency gates.

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod epp;
pub mod gate;
pub mod log;
pub mod pdp;
pub mod replay;
pub mod replica;
pub mod revision;
pub mod service;
pub mod simulate;
pub mod snapshot;
pub mod state;
pub mod write;

#[cfg(test)]
mod test_utils;
