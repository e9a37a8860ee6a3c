pub mod acceptor;
pub mod engine;

pub use acceptor::*;
pub use engine::*;
