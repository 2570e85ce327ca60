//! Utility modules for nvr-bridge
//!
//! This module contains common utilities used across the codebase.

pub mod net;

pub use net::bind_udp_socket;
