use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::models::CREDENTIAL_TYPE_GITHUB_PAT;

/// AES-GCM nonce length; ciphertext rows are stored as nonce || ciphertext.
const NONCE_LEN: usize = 12;

/// Fetch and decrypt the most recently created GitHub PAT.
///
/// Returns `None` when no credential row exists. Looked up fresh for every
/// job — tokens can be rotated in the credential store at any time.
pub async fn latest_github_pat(
    pool: &PgPool,
    encryption_secret: &str,
) -> Result<Option<String>, anyhow::Error> {
    let ciphertext: Option<Vec<u8>> = sqlx::query_scalar(
        r#"SELECT credentials FROM service_auth_credentials
           WHERE type = $1
           ORDER BY created_at DESC
           LIMIT 1"#,
    )
    .bind(CREDENTIAL_TYPE_GITHUB_PAT)
    .fetch_optional(pool)
    .await?
    .flatten();

    let Some(ciphertext) = ciphertext else {
        return Ok(None);
    };

    if encryption_secret.is_empty() {
        anyhow::bail!("credential row present but ENCRYPTION_SECRET is not set");
    }

    let plaintext = decrypt(encryption_secret, &ciphertext)?;
    let token = String::from_utf8(plaintext)
        .map_err(|_| anyhow::anyhow!("decrypted credential is not valid UTF-8"))?;

    Ok(Some(token))
}

fn cipher_for(secret: &str) -> Aes256Gcm {
    let key = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(&key)
}

fn decrypt(secret: &str, data: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    if data.len() <= NONCE_LEN {
        anyhow::bail!("credential ciphertext too short ({} bytes)", data.len());
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);

    cipher_for(secret)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("failed to decrypt credential (wrong ENCRYPTION_SECRET?)"))
}
