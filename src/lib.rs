pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod form;
pub mod response;
pub mod server;
pub mod summarize;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
