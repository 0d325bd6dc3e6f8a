pub mod identity;
pub mod reconciliation;

pub use identity::*;
pub use reconciliation::*;
