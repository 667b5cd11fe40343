pub mod store;

pub use store::{TaskStore, TaskTxn};
