pub mod cache;
pub mod error;
pub mod fsio;
pub mod hashing;
pub mod lang;
pub mod symbols;
pub mod text_edit;

pub use error::{Error, Result};
