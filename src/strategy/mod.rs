pub mod engine;
pub mod window;

pub use engine::QueryStrategy;
