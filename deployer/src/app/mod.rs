//! Deployment driver and its configuration

pub mod options;
pub mod prompt;
pub mod run;
