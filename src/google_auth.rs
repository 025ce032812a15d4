use crate::error::Error;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

pub const SHEETS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The parts of a service account key file needed to mint access tokens.
#[derive(Deserialize, Debug, Clone)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone)]
pub enum GoogleCredentials {
    ServiceAccount(ServiceAccountKey),
    AccessToken(String),
}

impl GoogleCredentials {
    /// Prefers an explicitly issued access token over a service account key.
    pub fn from_config(
        service_account_json: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<Self, Error> {
        match (access_token, service_account_json) {
            (Some(token), _) => Ok(GoogleCredentials::AccessToken(token.to_string())),
            (None, Some(raw)) => Ok(GoogleCredentials::ServiceAccount(
                ServiceAccountKey::from_json(raw)?,
            )),
            (None, None) => Err(Error::MissingCredentials),
        }
    }

    /// Returns a bearer token valid for `scopes`.
    pub async fn access_token(&self, client: &Client, scopes: &[&str]) -> Result<String, Error> {
        match self {
            GoogleCredentials::AccessToken(token) => Ok(token.clone()),
            GoogleCredentials::ServiceAccount(key) => {
                exchange_assertion(client, key, &scopes.join(" ")).await
            }
        }
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn signed_assertion(key: &ServiceAccountKey, scope: &str, issued_at: i64) -> Result<String, Error> {
    let claims = Claims {
        iss: &key.client_email,
        scope,
        aud: &key.token_uri,
        iat: issued_at,
        exp: issued_at + ASSERTION_LIFETIME_SECS,
    };

    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
    Ok(encode(&Header::new(Algorithm::RS256), &claims, &signing_key)?)
}

async fn exchange_assertion(
    client: &Client,
    key: &ServiceAccountKey,
    scope: &str,
) -> Result<String, Error> {
    let assertion = signed_assertion(key, scope, Utc::now().timestamp())?;

    debug!("Requesting Google access token for {}", key.client_email);

    let resp = client
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await?;

    if resp.status() != StatusCode::OK {
        return Err(Error::UnexpectedStatus {
            source_name: "Google OAuth".to_string(),
            status: resp.status().as_u16(),
            body: resp.text().await.unwrap_or_default(),
        });
    }

    let token = resp.json::<TokenResponse>().await?;
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_JSON: &str = r#"{
        "type": "service_account",
        "project_id": "project",
        "private_key_id": "abc",
        "private_key": "not a pem",
        "client_email": "etl@project.iam.gserviceaccount.com"
    }"#;

    #[test]
    fn test_service_account_key_from_json() {
        let key = ServiceAccountKey::from_json(KEY_JSON).unwrap();
        assert_eq!(key.client_email, "etl@project.iam.gserviceaccount.com");
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);

        assert!(matches!(
            ServiceAccountKey::from_json("{}").unwrap_err(),
            Error::Json(_)
        ));
    }

    #[test]
    fn test_invalid_private_key_is_rejected() {
        let key = ServiceAccountKey::from_json(KEY_JSON).unwrap();
        let result = signed_assertion(&key, BIGQUERY_SCOPE, 0);
        assert!(matches!(result.unwrap_err(), Error::Jwt(_)));
    }

    #[test]
    fn test_credentials_from_config() {
        assert!(matches!(
            GoogleCredentials::from_config(None, Some("token")).unwrap(),
            GoogleCredentials::AccessToken(t) if t == "token"
        ));
        assert!(matches!(
            GoogleCredentials::from_config(Some(KEY_JSON), None).unwrap(),
            GoogleCredentials::ServiceAccount(_)
        ));
        assert!(matches!(
            GoogleCredentials::from_config(None, None).unwrap_err(),
            Error::MissingCredentials
        ));
    }

    #[tokio::test]
    async fn test_static_access_token() {
        let credentials = GoogleCredentials::AccessToken("static".to_string());
        let token = credentials
            .access_token(&Client::new(), &[SHEETS_READONLY_SCOPE])
            .await
            .unwrap();
        assert_eq!(token, "static");
    }
}
