pub mod memory;
pub mod traits;

pub use memory::{MemoryStore, StoreOptions, FIRST_GENERATED_ID};
pub use traits::{Store, Visitor};
