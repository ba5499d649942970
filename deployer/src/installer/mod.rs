//! Host dependency probing and installation

pub mod install;
pub mod os;
pub mod tools;
