#![doc = include_str!("../../../README.md")]

pub use server::Server;
pub use version::Version;

pub mod afd;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod httpd;
pub mod kmp;
#[cfg(target_os = "linux")]
pub mod ktls;
pub mod mailbox;
pub mod promise;
pub mod reload;
pub mod runtime;
mod server;
mod version;
pub mod worker;
