//! Simulation toolkit for the data session supervisor.
//!
//! Provides a scripted modem that answers radio commands through the
//! runtime's event channel, an APN table loaded from TOML, shared traffic
//! counters, a JSON-file preference store, and a runner for timed
//! scenario files.

pub mod counters;
pub mod modem;
pub mod prefs;
pub mod scenario;
pub mod table;
