//! Control plane for the deeprotection daemon: edits its config file in
//! place, tails its log over SSE and runs its reload/restart commands.

pub mod api;
pub mod config;
pub mod control;
pub mod daemon_conf;
pub mod locales;
pub mod metrics;
pub mod tail;
pub mod web_settings;
