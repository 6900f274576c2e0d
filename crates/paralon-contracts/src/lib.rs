pub mod assets;
pub mod constraints;
pub mod errors;
pub mod requests;
