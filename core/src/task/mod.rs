pub mod runtime;
pub mod service;
pub mod tick;
