pub mod dispatcher;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod language;
pub mod materializer;

#[cfg(test)]
mod engine_tests;
#[cfg(test)]
mod testing;

pub use engine::{DockerBackend, IsolationRunner, SandboxBackend};
pub use executor::Grader;
pub use language::{Runtime, RuntimeRegistry};
