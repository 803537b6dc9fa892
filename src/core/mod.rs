// Core modules: error model, lifecycle latches, wire codec, and server scripts.
pub mod error;
pub mod lifecycle;
pub mod resp;
pub mod scripts;
