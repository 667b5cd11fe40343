pub mod store;

pub use store::{ReadPoolConfig, StoreConfig, SynchronousMode};
