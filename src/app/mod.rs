//! Application module

pub mod cli;
pub mod display;
pub mod startup;
