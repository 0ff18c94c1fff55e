/// 認証情報の暗号化
pub mod encryption;

pub use encryption::{CredentialEncryption, EncryptionError};
