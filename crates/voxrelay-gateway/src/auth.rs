//! Authentication of the claim carried by `start`.

use sha2::{Digest, Sha256};

use voxrelay_core::config::AuthConfig;
use voxrelay_core::protocol::AuthClaim;
use voxrelay_core::session::AuthKind;

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn digest(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// Check a client's claim against the configured mode.
///
/// Returns how the client authenticated, or a reason suitable for the
/// `auth_failed` error message.
pub fn authenticate(config: Option<&AuthConfig>, claim: Option<&AuthClaim>) -> Result<AuthKind, String> {
    let mode = config.map(|a| a.effective_mode()).unwrap_or("none");

    match mode {
        "none" => Ok(AuthKind::Anonymous),
        "token" => {
            let expected = config
                .and_then(|a| a.resolve_token())
                .ok_or_else(|| "Server token not configured".to_string())?;

            match claim {
                Some(AuthClaim::Token { token }) if constant_time_eq(token, &expected) => {
                    Ok(AuthKind::Token)
                }
                Some(AuthClaim::Token { .. }) => Err("Invalid token".to_string()),
                _ => Err("Token authentication required".to_string()),
            }
        }
        "password" => {
            let expected = config
                .and_then(|a| a.resolve_password())
                .ok_or_else(|| "Server password not configured".to_string())?;

            match claim {
                Some(AuthClaim::Password { password }) => {
                    if constant_time_eq(&digest(password), &digest(&expected)) {
                        Ok(AuthKind::Password)
                    } else {
                        Err("Invalid password".to_string())
                    }
                }
                _ => Err("Password authentication required".to_string()),
            }
        }
        other => Err(format!("Unknown auth mode: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_config(mode: &str, token: Option<&str>, password: Option<&str>) -> AuthConfig {
        AuthConfig {
            mode: Some(mode.to_string()),
            token: token.map(|s| s.to_string()),
            token_env: None,
            password: password.map(|s| s.to_string()),
            password_env: None,
        }
    }

    #[test]
    fn test_auth_mode_none() {
        assert_eq!(authenticate(None, None), Ok(AuthKind::Anonymous));
        let config = auth_config("none", None, None);
        let claim = AuthClaim::Token { token: "ignored".into() };
        assert_eq!(authenticate(Some(&config), Some(&claim)), Ok(AuthKind::Anonymous));
    }

    #[test]
    fn test_auth_token_valid() {
        let config = auth_config("token", Some("secret-token"), None);
        let claim = AuthClaim::Token {
            token: "secret-token".into(),
        };
        assert_eq!(authenticate(Some(&config), Some(&claim)), Ok(AuthKind::Token));
    }

    #[test]
    fn test_auth_token_invalid() {
        let config = auth_config("token", Some("secret-token"), None);
        let claim = AuthClaim::Token {
            token: "wrong-token".into(),
        };
        assert!(authenticate(Some(&config), Some(&claim)).is_err());
    }

    #[test]
    fn test_auth_token_missing() {
        let config = auth_config("token", Some("secret-token"), None);
        assert!(authenticate(Some(&config), None).is_err());
        let wrong_kind = AuthClaim::Password {
            password: "secret-token".into(),
        };
        assert!(authenticate(Some(&config), Some(&wrong_kind)).is_err());
    }

    #[test]
    fn test_auth_password_valid() {
        let config = auth_config("password", None, Some("my-password"));
        let claim = AuthClaim::Password {
            password: "my-password".into(),
        };
        assert_eq!(authenticate(Some(&config), Some(&claim)), Ok(AuthKind::Password));
    }

    #[test]
    fn test_auth_password_invalid() {
        let config = auth_config("password", None, Some("my-password"));
        let claim = AuthClaim::Password {
            password: "wrong".into(),
        };
        assert!(authenticate(Some(&config), Some(&claim)).is_err());
    }

    #[test]
    fn test_unconfigured_secret_rejects() {
        let config = auth_config("token", None, None);
        let claim = AuthClaim::Token { token: String::new() };
        assert!(authenticate(Some(&config), Some(&claim)).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(!constant_time_eq("hello", "world"));
        assert!(!constant_time_eq("hello", "hell"));
    }
}
