//! Serialized generation worker.
//!
//! [`queue::ExecutionQueue`] accepts jobs from any front end and runs
//! them one at a time through a [`runner::JobRunner`], delivering exactly
//! one result per job. [`watchdog::spawn_watchdog`] restarts dispatch if
//! a trigger is ever lost.

pub mod config;
pub mod intake;
pub mod job;
pub mod queue;
pub mod runner;
pub mod watchdog;
