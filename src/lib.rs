pub mod application;
pub mod webserver;
