pub mod exchange;
pub mod message;
pub mod parser;
pub mod service;
pub mod url;
