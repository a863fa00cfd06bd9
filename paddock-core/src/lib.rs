pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod objects;
pub mod registry;
pub mod subnet;

pub use context::Context;
pub use error::{AggregateError, PaddockError, PaddockResult};
