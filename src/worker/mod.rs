//! HTTP traffic driver: pacer math, the Rps/Concurrency drivers, per-request
//! execution, and the stat pipeline (§4.2).

pub mod driver;
pub mod pacer;
pub mod request;
pub mod stat;

pub use driver::{run_concurrency_driver, run_rps_driver, run_stepped_rps_driver, StopFlag};
pub use pacer::{ConstantPacer, LinearPacer};
