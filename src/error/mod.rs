mod types;

pub use types::{BlockError, Result};
