//! JWT generation for the Vonage Voice API (RS256, signed with the application's private key).

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::path::Path;

use super::ProviderError;

/// Token lifetime in seconds.
const TOKEN_TTL_SECS: i64 = 60 * 60;

#[derive(Debug, Serialize)]
struct Claims<'a> {
    application_id: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

/// Build a signed JWT for `application_id`. The key file is read on every call so a
/// rotated key is picked up without a restart.
pub async fn generate_jwt(
    application_id: &str,
    private_key_path: &Path,
) -> Result<String, ProviderError> {
    if application_id.trim().is_empty() {
        return Err(ProviderError::AuthFailure(
            "application id not provided for JWT generation".to_string(),
        ));
    }
    let pem = tokio::fs::read(private_key_path).await.map_err(|e| {
        ProviderError::AuthFailure(format!(
            "reading private key {}: {}",
            private_key_path.display(),
            e
        ))
    })?;
    if pem.iter().all(u8::is_ascii_whitespace) {
        return Err(ProviderError::AuthFailure(format!(
            "private key file is empty: {}",
            private_key_path.display()
        )));
    }
    let key = EncodingKey::from_rsa_pem(&pem)
        .map_err(|e| ProviderError::AuthFailure(format!("invalid private key: {}", e)))?;

    let iat = chrono::Utc::now().timestamp();
    let claims = Claims {
        application_id,
        iat,
        exp: iat + TOKEN_TTL_SECS,
        jti: uuid::Uuid::new_v4().to_string(),
    };
    let token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| ProviderError::AuthFailure(format!("JWT encoding error: {}", e)))?;
    log::debug!("generated JWT for application {}", application_id);
    Ok(token)
}
