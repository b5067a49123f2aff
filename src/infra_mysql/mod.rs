mod store_mysql;
mod util;

pub use store_mysql::*;
