//! `peckmesh`: a distributed HTTP load-generation platform split into a
//! Controller (admission + placement + admin API), Workers (pacer-driven
//! request drivers), and an Integrator (aggregation + analytics), wired
//! together over a Registry and a compare-and-swap cost ledger (§2).

pub mod analytics;
pub mod config;
pub mod controller;
pub mod errors;
pub mod ids;
pub mod integrator;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod record_store;
pub mod registry;
pub mod rpc;
pub mod scripting;
pub mod worker;
