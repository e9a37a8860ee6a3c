pub mod interest;
pub mod reactor;

pub use interest::*;
pub use reactor::*;
