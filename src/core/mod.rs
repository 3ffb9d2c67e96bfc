pub mod errors;
pub mod optimized;
pub mod program;
pub mod signature;

pub use errors::*;
pub use optimized::*;
pub use program::*;
pub use signature::*;
