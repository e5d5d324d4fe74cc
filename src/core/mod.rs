pub mod blinding;
pub mod types;

pub use blinding::*;
pub use types::*;
