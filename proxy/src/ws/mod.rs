pub mod frame;
pub mod handshake;
pub mod pipeline;
pub mod service;
