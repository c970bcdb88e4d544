pub mod aes_vault;

pub use aes_vault::AesGcmVault;
