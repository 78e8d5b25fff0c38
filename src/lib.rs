//! bootgen library.
//!
//! The binary is a thin CLI over [`generator::BootGenerator`]; integration
//! tests drive the same types directly.

pub mod archive;
pub mod cache;
pub mod common;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod fakeroot;
pub mod fetch;
pub mod generator;
pub mod manifest;
pub mod placement;
pub mod process;
pub mod repo;
pub mod resolve;
pub mod scripts;
pub mod timing;

pub use error::{BuildError, Result};
pub use generator::{BootGenerator, BuildContext};
pub use manifest::Manifest;
