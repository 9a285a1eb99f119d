#![forbid(unsafe_code)]

pub mod auth;
pub mod bridge;
pub mod connection;
pub mod hub;
pub mod member_cache;
pub mod offline;
pub mod router;



#[cfg(test)]
mod member_cache_tests;



#[cfg(test)]
mod session_tests;
