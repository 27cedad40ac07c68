pub mod calc;
pub mod circuit;
pub mod consumer;
pub mod panel;
pub mod touch;
pub mod types;

pub use calc::*;
pub use circuit::*;
pub use consumer::*;
pub use panel::*;
pub use touch::*;
pub use types::*;
