//! Core types, config, errors, and realtime wire protocol for Parley.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
