//! # Commands
//!
//! One module per subcommand.

pub(crate) mod count;
pub(crate) mod inspect;
pub(crate) mod resolve;
pub(crate) mod symbols;

pub(crate) use count::Count;
pub(crate) use inspect::Inspect;
pub(crate) use resolve::Resolve;
pub(crate) use symbols::Symbols;
