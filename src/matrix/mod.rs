pub mod client;
pub mod txn;
pub mod types;

#[cfg(test)]
pub use client::test_support;
pub use client::{MatrixApi, MatrixClient};
pub use types::*;
