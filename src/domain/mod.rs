pub mod billing;
pub mod event;
pub mod plan;

pub use billing::*;
pub use event::*;
pub use plan::*;
