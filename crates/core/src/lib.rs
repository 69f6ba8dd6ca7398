pub mod config;
pub mod error;
pub mod mask;
pub mod payload;

pub use config::MantisConfig;
pub use error::*;
pub use mask::SelectionMask;
pub use payload::*;
