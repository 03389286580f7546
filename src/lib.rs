//! Newsletter distiller: labeled newsletters in, one summarized digest out.

pub mod config;
pub mod deliver;
pub mod digest;
pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod summarize;

pub use error::{Error, Result};
