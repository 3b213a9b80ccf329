//! # Helpers
//!
//! Utilities used by the command line tool.

pub(crate) mod logger;
pub(crate) mod signals;
