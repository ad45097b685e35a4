pub mod memory;
mod provider;

pub use memory::MemoryKv;
pub use provider::{key_for, KvError, KvNode, KvProvider};
