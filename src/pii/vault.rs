//! Token ↔ original-value vault.
//!
//! Scrubs PII out of ticket text before any external model sees it and
//! rehydrates tokens in model output afterwards. Originals are held
//! encrypted (AES-256-GCM, per-process key); the key is never logged.

use std::collections::HashMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use uuid::Uuid;

use super::patterns::{self, PiiKind};
use crate::error::{FlowError, Result};

const NONCE_LEN: usize = 12;

/// Decrypted view of one binding.
#[derive(Debug, Clone, PartialEq)]
pub struct PiiBinding {
    pub token: String,
    pub kind: PiiKind,
    pub original: String,
}

struct StoredBinding {
    token: String,
    kind: PiiKind,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

pub struct PiiVault {
    cipher: Aes256Gcm,
    bindings: RwLock<HashMap<Uuid, Vec<StoredBinding>>>,
}

impl PiiVault {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Vault with a random per-process key; bindings do not survive the
    /// process, which is all the pipeline needs.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(&key)
    }

    /// Replace every detected PII occurrence with a `⟦KIND:N⟧` token and
    /// store the encrypted originals. Counters are per ticket, per kind.
    pub fn scrub(&self, ticket_id: Uuid, text: &str) -> Result<(String, usize)> {
        let spans = patterns::detect(text);
        if spans.is_empty() {
            return Ok((text.to_string(), 0));
        }

        let mut counters: HashMap<PiiKind, u32> = HashMap::new();
        let mut stored = Vec::with_capacity(spans.len());
        let mut scrubbed = text.to_string();

        // Tokens are numbered in reading order, replaced back-to-front so
        // byte offsets stay valid.
        let mut tokens = Vec::with_capacity(spans.len());
        for span in &spans {
            let n = counters.entry(span.kind).or_insert(0);
            *n += 1;
            tokens.push(format!("\u{27E6}{}:{}\u{27E7}", span.kind.tag(), n));
        }

        for (span, token) in spans.iter().zip(&tokens).rev() {
            scrubbed.replace_range(span.start..span.end, token);
        }

        for (span, token) in spans.iter().zip(tokens) {
            let mut nonce = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);
            let ciphertext = self
                .cipher
                .encrypt(Nonce::from_slice(&nonce), span.text.as_bytes())
                .map_err(|_| FlowError::Crypto("binding encryption failed".into()))?;
            stored.push(StoredBinding {
                token,
                kind: span.kind,
                nonce,
                ciphertext,
            });
        }

        let count = stored.len();
        self.bindings.write().insert(ticket_id, stored);
        Ok((scrubbed, count))
    }

    /// Replace tokens in `text` back with their originals. Tokens are
    /// substituted longest-first so `⟦PHONE:1⟧` never clobbers `⟦PHONE:10⟧`.
    pub fn rehydrate(&self, ticket_id: Uuid, text: &str) -> Result<String> {
        let mut bindings = self.decrypt_bindings(ticket_id)?;
        if bindings.is_empty() {
            return Ok(text.to_string());
        }
        bindings.sort_by(|a, b| b.token.len().cmp(&a.token.len()));

        let mut result = text.to_string();
        for binding in &bindings {
            result = result.replace(&binding.token, &binding.original);
        }
        Ok(result)
    }

    /// Decrypted bindings for a ticket, in token order.
    pub fn bindings(&self, ticket_id: Uuid) -> Result<Vec<PiiBinding>> {
        self.decrypt_bindings(ticket_id)
    }

    /// Drop all bindings belonging to a ticket (batch-level purge).
    pub fn purge(&self, ticket_id: Uuid) {
        self.bindings.write().remove(&ticket_id);
    }

    fn decrypt_bindings(&self, ticket_id: Uuid) -> Result<Vec<PiiBinding>> {
        let guard = self.bindings.read();
        let Some(stored) = guard.get(&ticket_id) else {
            return Ok(Vec::new());
        };
        stored
            .iter()
            .map(|b| {
                let plaintext = self
                    .cipher
                    .decrypt(Nonce::from_slice(&b.nonce), b.ciphertext.as_ref())
                    .map_err(|_| FlowError::Crypto("binding decryption failed".into()))?;
                Ok(PiiBinding {
                    token: b.token.clone(),
                    kind: b.kind,
                    original: String::from_utf8(plaintext)
                        .map_err(|_| FlowError::Crypto("binding is not utf-8".into()))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_rehydrate_round_trip() {
        let vault = PiiVault::ephemeral();
        let id = Uuid::new_v4();
        let text = "Иван Петров, ИИН 880123456789, тел +7 701 123 45 67, ivan@example.com";
        let (scrubbed, count) = vault.scrub(id, text).unwrap();

        assert_eq!(count, 4);
        assert!(!scrubbed.contains("880123456789"));
        assert!(!scrubbed.contains("ivan@example.com"));
        assert!(scrubbed.contains("\u{27E6}ID:1\u{27E7}"));

        let restored = vault.rehydrate(id, &scrubbed).unwrap();
        assert_eq!(restored, text);
    }

    #[test]
    fn test_round_trip_without_pii() {
        let vault = PiiVault::ephemeral();
        let id = Uuid::new_v4();
        let text = "просто вопрос про тарифы";
        let (scrubbed, count) = vault.scrub(id, text).unwrap();
        assert_eq!(count, 0);
        assert_eq!(vault.rehydrate(id, &scrubbed).unwrap(), text);
    }

    #[test]
    fn test_tokens_unique_per_ticket() {
        let vault = PiiVault::ephemeral();
        let id = Uuid::new_v4();
        let text = "тел 87011234567 и второй 87019876543";
        vault.scrub(id, text).unwrap();
        let bindings = vault.bindings(id).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_ne!(bindings[0].token, bindings[1].token);
    }

    #[test]
    fn test_many_tokens_no_prefix_clobber() {
        let vault = PiiVault::ephemeral();
        let id = Uuid::new_v4();
        let phones: Vec<String> = (0..11).map(|n| format!("+7701123456{n}")).collect();
        let text = phones.join(" и ");
        let (scrubbed, count) = vault.scrub(id, &text).unwrap();
        assert_eq!(count, 11);
        assert!(scrubbed.contains("\u{27E6}PHONE:10\u{27E7}"));
        assert_eq!(vault.rehydrate(id, &scrubbed).unwrap(), text);
    }

    #[test]
    fn test_purge_drops_bindings() {
        let vault = PiiVault::ephemeral();
        let id = Uuid::new_v4();
        vault.scrub(id, "тел 87011234567").unwrap();
        vault.purge(id);
        assert!(vault.bindings(id).unwrap().is_empty());
    }
}
