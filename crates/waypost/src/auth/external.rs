//! External identity: bearer tokens issued elsewhere, validated against the
//! provider's published key set.

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::store::Role;

use super::identity::{Identity, TokenValidator};
use super::AuthError;

/// Role entry that marks an org administrator in external tokens.
const ORG_ADMIN_ROLE: &str = "org:admin";

#[derive(Debug, Deserialize)]
struct ExternalClaims {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    org: Option<String>,
    #[allow(dead_code)]
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

pub struct ExternalAuth {
    keys: Vec<(Option<String>, DecodingKey)>,
    issuer: Option<String>,
}

impl ExternalAuth {
    /// Fetch the provider's JWKS once and keep the decoded keys.
    pub async fn from_jwks_url(url: &str, issuer: Option<String>) -> anyhow::Result<Self> {
        let jwks: Jwks = reqwest::get(url).await?.error_for_status()?.json().await?;
        let mut keys = Vec::new();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                continue;
            };
            let key = DecodingKey::from_rsa_components(n, e)?;
            keys.push((jwk.kid, key));
        }
        if keys.is_empty() {
            anyhow::bail!("key set at {url} contains no usable RSA keys");
        }
        Ok(Self { keys, issuer })
    }

    #[cfg(test)]
    fn validation(&self) -> Validation {
        self.build_validation()
    }

    fn build_validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

#[async_trait]
impl TokenValidator for ExternalAuth {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let validation = self.build_validation();

        // Prefer the key matching the token's kid; fall back to trying all.
        let candidates: Vec<&DecodingKey> = match &header.kid {
            Some(kid) => {
                let matched: Vec<&DecodingKey> = self
                    .keys
                    .iter()
                    .filter(|(k, _)| k.as_deref() == Some(kid))
                    .map(|(_, key)| key)
                    .collect();
                if matched.is_empty() {
                    self.keys.iter().map(|(_, key)| key).collect()
                } else {
                    matched
                }
            }
            None => self.keys.iter().map(|(_, key)| key).collect(),
        };

        let mut last_err = AuthError::InvalidToken("no keys".into());
        for key in candidates {
            match decode::<ExternalClaims>(token, key, &validation) {
                Ok(data) => {
                    let claims = data.claims;
                    let role = if claims.roles.iter().any(|r| r == ORG_ADMIN_ROLE) {
                        Role::Admin
                    } else {
                        Role::User
                    };
                    let username = claims
                        .preferred_username
                        .or(claims.name)
                        .unwrap_or_else(|| claims.sub.clone());
                    return Ok(Identity {
                        user_id: claims.sub,
                        username,
                        role,
                        org_id: claims.org.unwrap_or_else(|| "default".to_string()),
                    });
                }
                Err(e) => {
                    last_err = match e.kind() {
                        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                            AuthError::TokenExpired
                        }
                        _ => AuthError::InvalidToken(e.to_string()),
                    };
                }
            }
        }
        Err(last_err)
    }

    fn provider_name(&self) -> &'static str {
        "external"
    }

    fn is_external(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_is_enforced_when_configured() {
        let auth = ExternalAuth {
            keys: vec![(None, DecodingKey::from_secret(b"x"))],
            issuer: Some("https://idp.example".into()),
        };
        let validation = auth.validation();
        assert!(validation.iss.is_some());
    }

    #[test]
    fn org_admin_role_constant_matches_wire_value() {
        assert_eq!(ORG_ADMIN_ROLE, "org:admin");
    }
}
