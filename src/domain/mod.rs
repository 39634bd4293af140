pub mod models;
pub mod reassembler;
pub mod settings;
