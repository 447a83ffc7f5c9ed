pub mod engine;
pub mod link;
pub mod session;
pub mod snapshot;
pub mod tx;
