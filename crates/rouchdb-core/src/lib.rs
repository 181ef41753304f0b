pub mod adapter;
pub mod document;
pub mod error;
pub mod merge;
pub mod rev_tree;

pub use adapter::Adapter;
pub use error::{Result, RouchError};
