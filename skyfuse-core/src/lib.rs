#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod config;
pub mod connections;
pub mod entities;
pub mod events;
pub mod framework;
pub mod live_store;
pub mod mapper;
pub mod merge;
pub mod processors;
pub mod queue;
pub mod repository;
pub mod source;
pub mod subscribers;
pub mod utils;
