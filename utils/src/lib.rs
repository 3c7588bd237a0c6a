// A set of helper structs for common operations
//
// Austin Shafer - 2020
pub mod log;
pub mod region;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};
