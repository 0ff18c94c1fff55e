use crate::shared::errors::AppError;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AES-256-GCM";
const NONCE_LENGTH: usize = 12;

/// 暗号化エラー
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("暗号化エラー: {0}")]
    EncryptionFailed(String),

    #[error("復号化エラー: {0}")]
    DecryptionFailed(String),

    #[error("Base64エンコードエラー: {0}")]
    Base64Error(String),

    #[error("データ形式エラー: {0}")]
    FormatError(String),
}

impl From<EncryptionError> for AppError {
    fn from(error: EncryptionError) -> Self {
        AppError::Security(error.to_string())
    }
}

/// 保存用の暗号化済み認証情報
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedCredential {
    /// 暗号文（Base64エンコード）
    ciphertext: String,
    /// ナンス（Base64エンコード）
    nonce: String,
    /// 暗号化アルゴリズム
    algorithm: String,
}

/// 銀行フィード認証情報の暗号化サービス
///
/// 認証情報は保存時に暗号化し、フィード呼び出しの直前にのみ復号する。
#[derive(Clone)]
pub struct CredentialEncryption {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEncryption")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CredentialEncryption {
    /// 設定値のキー文字列から暗号化サービスを作成する
    ///
    /// キー文字列はSHA-256で32バイトに正規化される。
    pub fn new(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&digest);
        Self { key: key_bytes }
    }

    /// 認証情報を暗号化してBase64文字列として返す
    ///
    /// # 引数
    /// * `credential` - 平文のアクセストークン
    ///
    /// # 戻り値
    /// JSONエンベロープをBase64エンコードした文字列
    pub fn encrypt_credential(&self, credential: &str) -> Result<String, EncryptionError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, credential.as_bytes())
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let sealed = SealedCredential {
            ciphertext: general_purpose::STANDARD.encode(&ciphertext),
            nonce: general_purpose::STANDARD.encode(nonce_bytes),
            algorithm: ALGORITHM.to_string(),
        };

        let json_data = serde_json::to_string(&sealed)
            .map_err(|e| EncryptionError::FormatError(format!("JSON変換エラー: {e}")))?;

        Ok(general_purpose::STANDARD.encode(json_data.as_bytes()))
    }

    /// Base64文字列から認証情報を復号化する
    ///
    /// # 引数
    /// * `sealed` - `encrypt_credential`で作成した文字列
    ///
    /// # 戻り値
    /// 平文のアクセストークン
    pub fn decrypt_credential(&self, sealed: &str) -> Result<String, EncryptionError> {
        let json_bytes = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| EncryptionError::Base64Error(format!("Base64デコードエラー: {e}")))?;

        let sealed: SealedCredential = serde_json::from_slice(&json_bytes)
            .map_err(|e| EncryptionError::FormatError(format!("JSON解析エラー: {e}")))?;

        if sealed.algorithm != ALGORITHM {
            return Err(EncryptionError::FormatError(format!(
                "サポートされていないアルゴリズム: {}",
                sealed.algorithm
            )));
        }

        let ciphertext = general_purpose::STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|e| EncryptionError::Base64Error(format!("暗号文デコードエラー: {e}")))?;
        let nonce_bytes = general_purpose::STANDARD
            .decode(&sealed.nonce)
            .map_err(|e| EncryptionError::Base64Error(format!("ナンスデコードエラー: {e}")))?;

        if nonce_bytes.len() != NONCE_LENGTH {
            return Err(EncryptionError::FormatError(
                "ナンスのサイズが正しくありません".to_string(),
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| EncryptionError::DecryptionFailed(format!("UTF-8変換エラー: {e}")))
    }
}
