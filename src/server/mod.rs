mod bridge;
mod port;
mod server;
mod sse;

pub use bridge::*;
pub use port::*;
pub use server::*;
pub use sse::*;
