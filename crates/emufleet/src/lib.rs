pub mod adb;
pub mod avd;
pub mod config;
pub mod fleet;
pub mod queue;
pub mod results;
pub mod snapshot;
pub mod worker;

pub use config::FleetConfig;
pub use fleet::{Fleet, FleetError};
