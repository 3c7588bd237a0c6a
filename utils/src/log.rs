// This makes it easy to import the logging stuff
//
// Callers do `use utils::log;` and then `log::debug!(...)`. Everything
// is routed through tracing so that the compositor decides where
// it ends up.
//
// Austin Shafer - 2020

#![allow(unused_imports)]
pub use tracing::{debug, error, info, trace, warn};
