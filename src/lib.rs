pub mod agent;
pub mod config;
pub mod errors;
pub mod hosting;
pub mod ledger;
pub mod logging;
pub mod process;
pub mod remediation;
pub mod status;
pub mod tracker;
pub mod vcs;
