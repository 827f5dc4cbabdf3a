use anyhow::{anyhow, Result};
use tracing::{debug, warn};

/// Upper bound on the auth backend response body. Larger bodies are
/// rejected outright rather than truncated into unparsable JSON.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Ask an external auth backend whether a user/signature pair is valid.
///
/// The backend is expected to answer with a JSON object carrying an
/// `errCode` field; a missing body, a non-JSON body, or `errCode == 0`
/// all count as accepted, mirroring the lenient behavior of the original
/// deployment.
pub async fn personal_auth(auth_url: &str, company_id: &str, auth_id: &str) -> Result<bool> {
    let url = format!(
        "{}?company_id={}&auth_id={}",
        auth_url, company_id, auth_id
    );
    debug!("personal auth lookup: {}", url);

    let response = reqwest::get(&url).await?;
    if let Some(length) = response.content_length() {
        if length as usize > MAX_BODY_BYTES {
            return Err(anyhow!("auth response too large: {} bytes", length));
        }
    }
    let body = response.bytes().await?;
    if body.len() > MAX_BODY_BYTES {
        return Err(anyhow!("auth response too large: {} bytes", body.len()));
    }

    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Object(object)) => {
            let err_code = object
                .get("errCode")
                .and_then(|code| code.as_i64())
                .unwrap_or(0);
            if err_code != 0 {
                warn!("personal auth rejected, errCode = {}", err_code);
            }
            Ok(err_code == 0)
        }
        _ => Ok(true),
    }
}
