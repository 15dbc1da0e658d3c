pub mod server;
pub mod system;
