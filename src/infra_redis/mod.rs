mod presence_redis;

pub use presence_redis::*;
