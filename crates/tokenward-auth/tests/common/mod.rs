//! Shared fixtures and a mock identity provider for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use tokenward_auth::{
    AuthConfig, AuthService, Endpoints, FixedClock, RequestCookies, ResponseCookie,
    ServiceAccount, SharedState,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SIGNING_KEY: &str = include_str!("../fixtures/signing_key.pem");
pub const OTHER_KEY: &str = include_str!("../fixtures/other_key.pem");
pub const SIGNING_CERT: &str = include_str!("../fixtures/signing_cert.pem");
pub const OTHER_CERT: &str = include_str!("../fixtures/other_cert.pem");
pub const JWKS: &str = include_str!("../fixtures/jwks.json");

pub const PROJECT: &str = "demo";
pub const API_KEY: &str = "api-key";
pub const NOW: u64 = 1_700_000_000;

/// Claims of a valid id token for `uid`, expiring `ttl` seconds from NOW.
pub fn id_claims(uid: &str, ttl: i64) -> Value {
    let exp = NOW.saturating_add_signed(ttl);
    json!({
        "iss": format!("https://securetoken.google.com/{PROJECT}"),
        "aud": PROJECT,
        "sub": uid,
        "user_id": uid,
        "iat": NOW - 600,
        "auth_time": NOW - 600,
        "exp": exp,
        "role": "editor",
    })
}

/// RS256-sign `claims` with a PEM key.
pub fn sign(key_pem: &str, kid: Option<&str>, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(str::to_string);
    jsonwebtoken::encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(key_pem.as_bytes()).unwrap(),
    )
    .unwrap()
}

/// Id token signed by the `key-1` fixture key.
pub fn id_token(uid: &str, ttl: i64) -> String {
    sign(SIGNING_KEY, Some("key-1"), &id_claims(uid, ttl))
}

/// The cookies a browser would send back after `cookies` were set.
pub fn jar(cookies: &[ResponseCookie]) -> RequestCookies {
    cookies
        .iter()
        .filter_map(|c| match c {
            ResponseCookie::Set(c) => Some((c.name.clone(), c.value.clone())),
            ResponseCookie::Expire(_) => None,
        })
        .collect()
}

pub fn service_account() -> ServiceAccount {
    ServiceAccount {
        project_id: PROJECT.to_string(),
        client_email: "auth@demo.iam.gserviceaccount.com".to_string(),
        private_key: SIGNING_KEY.to_string(),
    }
}

/// A mock of every upstream endpoint the engine talks to.
pub struct MockIdentityProvider {
    pub server: MockServer,
    pub clock: Arc<FixedClock>,
}

impl MockIdentityProvider {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
            clock: Arc::new(FixedClock::new(NOW * 1000)),
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Configuration pointing every endpoint at this server.
    pub fn config(&self) -> AuthConfig {
        AuthConfig {
            project_id: PROJECT.to_string(),
            api_key: API_KEY.to_string(),
            cookie_name: "session".to_string(),
            cookie_signature_keys: vec!["current-key".to_string(), "previous-key".to_string()],
            keys_url: Some(format!("{}/jwks", self.uri())),
            endpoints: Some(Endpoints {
                token_base: format!("{}/v1", self.uri()),
                identity_base: format!("{}/id/v1", self.uri()),
            }),
            oauth_token_url: Some(format!("{}/oauth/token", self.uri())),
            service_account: Some(service_account()),
            ..AuthConfig::default()
        }
    }

    pub fn service(&self, config: &AuthConfig) -> AuthService {
        let shared = SharedState::new(reqwest::Client::new(), self.clock.clone());
        AuthService::from_config(config, shared).unwrap()
    }

    pub async fn mock_jwks(&self, max_age: Option<u64>, expected: u64) {
        let mut response = ResponseTemplate::new(200).set_body_string(JWKS);
        if let Some(max_age) = max_age {
            response =
                response.insert_header("Cache-Control", format!("public, max-age={max_age}"));
        }
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(response)
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_x509(&self, certificates: Value) {
        Mock::given(method("GET"))
            .and(path("/x509"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Cache-Control", "max-age=3600")
                    .set_body_json(certificates),
            )
            .mount(&self.server)
            .await;
    }

    pub async fn mock_refresh(&self, id_token: &str, refresh_token: &str, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .and(query_param("key", API_KEY))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id_token": id_token,
                "refresh_token": refresh_token,
                "expires_in": "3600",
                "token_type": "Bearer",
            })))
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_refresh_error(&self, status: u16, message: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "error": { "code": status, "message": message }
            })))
            .expect(1)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_sign_in(&self, id_token: &str, refresh_token: &str) {
        Mock::given(method("POST"))
            .and(path("/id/v1/accounts:signInWithCustomToken"))
            .and(query_param("key", API_KEY))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "idToken": id_token,
                "refreshToken": refresh_token,
                "expiresIn": "3600",
            })))
            .expect(1)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_oauth_token(&self, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "upstream-access-token",
                "token_type": "Bearer",
                "expires_in": 3600,
            })))
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_lookup(&self, uid: &str, disabled: bool, valid_since: Option<u64>) {
        let mut user = json!({ "localId": uid, "disabled": disabled });
        if let Some(valid_since) = valid_since {
            user["validSince"] = json!(valid_since.to_string());
        }
        Mock::given(method("POST"))
            .and(path(format!("/id/v1/projects/{PROJECT}/accounts:lookup")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "users": [user] })))
            .mount(&self.server)
            .await;
    }
}
