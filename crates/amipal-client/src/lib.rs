pub mod commands;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod query;
pub mod sink;

mod socket;

#[cfg(test)]
mod fake_ami;

pub use commands::Originate;
pub use config::ControllerConfig;
pub use control::{ControlRequest, ControlRouter};
pub use controller::{encode_command, Controller, ControllerBuilder, PendingRequest, SessionEnd, SessionState, WaitOutcome};
pub use error::{AmiError, ArgumentError, ControlError};
pub use query::{build_arguments, CommandArgs, QueryOutcome};
pub use sink::{Direction, JsonlSink, TracingSink, TrafficRecord, TrafficSink};
