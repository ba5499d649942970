//! Host infrastructure adapters

pub mod command;
