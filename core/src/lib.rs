extern crate self as vstate_core;

pub mod log;
pub mod signals;
pub mod task;
pub mod time;
