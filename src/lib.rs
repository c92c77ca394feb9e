//! codespeak library crate
//!
//! Infers the bodies of Python function stubs with a language model, caches the generated
//! modules next to the project, and regenerates them when execution or attached tests fail.
//! The binary in `main.rs` is a thin CLI over [`engine::Engine`].

pub mod config;
pub mod declaration;
pub mod digest;
pub mod engine;
pub mod error;
pub mod execute;
pub mod llm;
pub mod store;
pub mod syntax;
pub mod testing;
pub mod types;
pub mod util;

pub use config::Config;
pub use engine::{Engine, ManagedFunction};
pub use error::{CodespeakError, Result};
