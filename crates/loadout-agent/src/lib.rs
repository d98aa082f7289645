//! Game session orchestration: companion apps, external tool integrations and
//! the game process, started and torn down as one unit.

pub mod app_coordinator;
pub mod avatar;
pub mod config;
pub mod control_channel;
pub mod integration_coordinator;
pub mod messages;
pub mod presence;
pub mod process_controller;
pub mod recording;
pub mod report;
pub mod session;
pub mod settings;
pub mod storefront;
