pub mod error;
pub mod fx_hash;
pub mod renamer;
pub mod types;
