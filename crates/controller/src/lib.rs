//! Unattended irrigation controller: sensing, decision arbitration,
//! actuation under a single critical section, daily water budgeting and
//! scheduled metered irrigation.

pub mod actuator;
pub mod anomaly;
pub mod arbiter;
pub mod budget;
pub mod cloud;
pub mod conditioning;
pub mod config;
pub mod critical;
pub mod db;
pub mod error;
pub mod model;
pub mod panel;
pub mod registry;
pub mod scheduler;
pub mod season;
pub mod sensors;
#[cfg(feature = "sim")]
pub mod sim;
pub mod snapshot;
pub mod state;
pub mod supervisor;
pub mod web;
