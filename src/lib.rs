#![recursion_limit = "256"]

#[macro_use]
extern crate log;

pub mod config;
pub mod dataset;
pub mod errors;
pub mod process;
pub mod project;
pub mod splash;
pub mod tiled;
