//! `plantwire` daemon: command line, admin API and process lifecycle.

pub mod admin;
pub mod cli;
