//! Admission and placement: the controller subsystem (§4.1).

pub mod admission;
pub mod http;
pub mod placement;

pub use admission::{AdmissionError, Controller};
pub use http::AdminApi;
pub use placement::{place_task, PlacedTask};
