pub mod config;
pub mod counters;
pub mod errors;
pub mod gc;
pub mod marker;
pub mod meta;
pub mod pruner;
pub mod recycle_bin;
pub mod report;
pub mod roots;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;
