pub mod application;
pub mod bootstrap;
pub mod config;
pub mod domain;
pub mod http;
pub mod infrastructure;
pub mod worker;
