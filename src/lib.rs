//! Cup Light Bridge library
//! Bluetooth control layer for SP105E-driven illuminated golf cups.

pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
