use serde_json::Value;
use std::fmt;
use subtle::ConstantTimeEq;

use crate::error::RemoteError;

/// Credential appended to every call made over a network channel.
#[derive(Clone)]
pub struct SharedSecret(String);

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for handing to a child process's environment.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Appends the secret as the final parameter.
    pub fn seal(&self, params: &mut Vec<Value>) {
        params.push(Value::String(self.0.clone()));
    }

    /// Strips the final parameter and checks it against the secret.
    pub fn unseal(&self, params: &mut Vec<Value>) -> Result<(), RemoteError> {
        let presented = params.pop();
        let matches = match presented {
            Some(Value::String(ref key)) => bool::from(key.as_bytes().ct_eq(self.0.as_bytes())),
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(RemoteError::secret_mismatch())
        }
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn seal_then_unseal_restores_params() {
        let secret = SharedSecret::new("d963c4e0");
        let mut params = vec![json!("SELECT 1")];
        secret.seal(&mut params);
        assert_eq!(params.len(), 2);
        secret.unseal(&mut params).expect("matching secret");
        assert_eq!(params, vec![json!("SELECT 1")]);
    }

    #[test]
    fn wrong_or_missing_secret_is_rejected() {
        let secret = SharedSecret::new("d963c4e0");
        let mut wrong = vec![json!(1), json!("nope")];
        let err = secret.unseal(&mut wrong).expect_err("mismatch");
        assert_eq!(err.code, ErrorCode::SecretMismatch);

        let mut empty = Vec::new();
        assert!(secret.unseal(&mut empty).is_err());
        assert_eq!(format!("{secret:?}"), "SharedSecret(..)");
    }
}
