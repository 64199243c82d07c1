mod memory;

pub use memory::{MemoryBus, MemoryRouter, MemoryStore};
