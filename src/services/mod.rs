pub mod config;
pub mod connectivity;
pub mod memory;
pub mod paths;
pub mod retry;
pub mod typing;
