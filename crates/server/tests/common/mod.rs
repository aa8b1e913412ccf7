//! Common test utilities and fixtures.

pub mod engine;
pub mod fixtures;
pub mod metadata;
pub mod storage;

#[allow(unused_imports)]
pub use engine::*;
#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use metadata::*;
#[allow(unused_imports)]
pub use storage::*;
