//! Deployment steps

pub mod certs;
pub mod compose;
pub mod fsm;
pub mod git;
pub mod health;
pub mod outcome;
pub mod proxy;
