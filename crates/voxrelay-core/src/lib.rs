//! Core types, config, errors, wire frames and session model for VoxRelay.

pub mod config;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod seq;
pub mod session;
