// src/sys/secrets.rs

use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, Secret};
use std::fmt;

const SSH_SYMBOLS: &[u8] = b"!@#$%^&*";
const DB_PASSWORD_LEN: usize = 32;
const SSH_PASSWORD_LEN: usize = 16;

/// Credential is a memory-safe wrapper for generated passwords and the
/// database admin secret.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. When dropped, the backing `String` is zeroized.
pub struct Credential {
    value: Secret<String>,
}

impl Credential {
    /// Takes ownership of the plaintext so no second copy is left behind.
    pub fn new(raw: String) -> Self {
        Self { value: Secret::new(raw) }
    }

    /// Exposes the secret for the duration of `action` only. The borrow
    /// checker keeps the plaintext slice from escaping the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.value.expose_secret())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// 32 alphanumeric characters; safe to embed in a connection URI unescaped.
pub fn generate_db_password() -> Credential {
    let raw: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DB_PASSWORD_LEN)
        .map(char::from)
        .collect();
    Credential::new(raw)
}

/// 16 characters drawn from letters, digits and a small symbol set.
pub fn generate_ssh_password() -> Credential {
    let mut rng = rand::thread_rng();
    let raw: String = (0..SSH_PASSWORD_LEN)
        .map(|_| {
            // Alphanumerics make up 62 of the 70 possible picks.
            let pick = rng.gen_range(0..62 + SSH_SYMBOLS.len());
            if pick < 62 {
                char::from(rng.sample(Alphanumeric))
            } else {
                char::from(SSH_SYMBOLS[pick - 62])
            }
        })
        .collect();
    Credential::new(raw)
}

/// Everything an environment owner needs to log in. Handed out exactly once:
/// the orchestrator never keeps a copy.
#[derive(Debug)]
pub struct CredentialBundle {
    pub hostname: String,
    pub ssh_password: Credential,
    pub db_password: Credential,
}

impl CredentialBundle {
    pub fn generate(hostname: String) -> Self {
        Self {
            hostname,
            ssh_password: generate_ssh_password(),
            db_password: generate_db_password(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_is_redacted() {
        let cred = Credential::new("hunter2".to_string());
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn db_password_is_alphanumeric_and_sized() {
        generate_db_password().use_secret(|pw| {
            assert_eq!(pw.len(), DB_PASSWORD_LEN);
            assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
        });
    }

    #[test]
    fn ssh_password_uses_allowed_alphabet() {
        generate_ssh_password().use_secret(|pw| {
            assert_eq!(pw.chars().count(), SSH_PASSWORD_LEN);
            assert!(pw.bytes().all(|b| b.is_ascii_alphanumeric() || SSH_SYMBOLS.contains(&b)));
        });
    }

    #[test]
    fn bundles_do_not_repeat_passwords() {
        let a = CredentialBundle::generate("a.dev.internal".into());
        let b = CredentialBundle::generate("b.dev.internal".into());
        let pa = a.db_password.use_secret(str::to_string);
        let pb = b.db_password.use_secret(str::to_string);
        assert_ne!(pa, pb);
    }
}
