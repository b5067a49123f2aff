mod credential_hasher_impl;
mod persistence_pool;
mod rate_limiter;
mod session_service_impl;

pub use credential_hasher_impl::*;
pub use persistence_pool::*;
pub use rate_limiter::*;
pub use session_service_impl::*;
