mod credential_hasher;
mod session_service;
mod task_queue;

pub use credential_hasher::*;
pub use session_service::*;
pub use task_queue::*;
