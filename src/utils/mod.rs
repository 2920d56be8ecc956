//! Shared helpers for binaries and hosts.

pub mod bootstrap;
