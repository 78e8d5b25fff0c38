//! Shared utilities across bootgen modules.

pub mod paths;
pub mod temp;

pub use paths::{absolutize, archive_name, normalize};
pub use temp::{cleanup_staging_dir, cleanup_work_dir, staging_dir};
