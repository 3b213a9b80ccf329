//! # User
//!
//! Inspection of user space programs: executables, libraries and processes.

pub mod exec;
pub mod proc;
