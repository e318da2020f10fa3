pub mod handlers;
pub mod server;

pub use server::{router, start_web_server, AppState};
