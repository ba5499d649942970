//! Deployment tree layout and configuration loading

pub mod layout;
pub mod settings;
