// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod concurrency;
pub mod context;
pub mod guard;
pub mod protocol;
pub mod utils;

pub use utils::*;
