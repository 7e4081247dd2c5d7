pub mod identity;
pub mod keys;
pub mod node;
pub mod nodes;
pub mod prunable;
pub mod roots;
pub mod stale;
pub mod store;

pub use node::{NodeId, StateNode};
pub use prunable::PrunableStore;
pub use stale::StaleEntry;
pub use store::StateStore;
