//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running the server half
//! - Listing discoverable protocol packages
//! - Describing the stubs a package exposes

pub mod commands;
pub mod handlers;

pub use handlers::{handle_describe, handle_packages, handle_serve};
