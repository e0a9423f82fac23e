pub mod engine;

pub use engine::{Navigator, QueryResult};
