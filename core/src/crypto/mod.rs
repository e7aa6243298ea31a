// Cryptography module — payload sealing and integrity hashes

pub mod encrypt;

pub use encrypt::{open_payload, payload_hash, seal_payload, PayloadKey, NONCE_LEN};
