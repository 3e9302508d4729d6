//! Core types: configuration, errors, reply values

pub mod config;
pub mod error;
pub mod reply;
