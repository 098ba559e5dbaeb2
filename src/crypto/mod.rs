pub mod handshake;
pub mod keys;
