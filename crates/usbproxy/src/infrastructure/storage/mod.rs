//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration from the platform
//! config directory (or an explicit path) and turns it into the session
//! settings and filter chain the application layer works with.  A missing
//! file is not an error; every setting has a default.

pub mod config;
