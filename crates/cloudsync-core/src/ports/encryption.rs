//! Encryption port (driven/secondary port)
//!
//! Applied by the engine around transfer bodies: uploads are encrypted
//! before they leave, downloads are decrypted before they are written.

use crate::domain::SyncError;

#[async_trait::async_trait]
pub trait IEncryptionService: Send + Sync {
    async fn encrypt(&self, data: Vec<u8>) -> Result<Vec<u8>, SyncError>;

    async fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>, SyncError>;
}

/// Pass-through service for unencrypted drives
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

#[async_trait::async_trait]
impl IEncryptionService for NoEncryption {
    async fn encrypt(&self, data: Vec<u8>) -> Result<Vec<u8>, SyncError> {
        Ok(data)
    }

    async fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>, SyncError> {
        Ok(data)
    }
}
