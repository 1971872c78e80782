//! Device drivers
pub mod net;
