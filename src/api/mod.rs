pub mod handler;
pub mod schemas;
#[cfg(feature = "stdio")]
pub mod stdio;
#[cfg(feature = "sse")]
pub mod http;
