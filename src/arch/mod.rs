//! Platform seams: where files live, which shell to launch, where the CLI is.
//!
//! This module is intentionally "plumbing only": platform-neutral helpers with
//! the OS-specific branches kept in one place.

pub mod cli;
pub mod paths;
pub mod shell;
