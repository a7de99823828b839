mod concurrency;
mod pinning;
mod scenarios;

pub use utils::*;
