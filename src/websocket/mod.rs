pub mod handler;
pub mod server;

pub use handler::ClientSession;
pub use server::RelayServer;
