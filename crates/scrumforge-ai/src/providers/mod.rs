//! Vendor adapter implementations

pub mod openai_compatible;

pub use openai_compatible::{openai_descriptor, OpenAiCompatibleProvider};
