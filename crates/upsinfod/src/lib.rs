//! upsinfod library - Synology UPS telemetry over SSH, exposed as accessory services.

pub mod accessory;
pub mod config;
pub mod errors;
pub mod hap;
pub mod nut;
pub mod poller;
pub mod remote;
pub mod telemetry;

pub use poller::{register, UpsPoller, ACCESSORY_NAME, PLUGIN_NAME};
