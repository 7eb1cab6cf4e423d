//! Length-framed hash inputs.
//!
//! Every multi-field digest in this crate is computed over a `Preimage`: a
//! domain tag followed by each field as `u64-le length || bytes`. Framing keeps
//! `("ab", "c")` and `("a", "bc")` from colliding, and the domain tag keeps a
//! signature hash from ever equalling a timestamp hash over the same bytes.

use zeroize::Zeroize;

use crate::provider::{CryptoProvider, Digest};

#[derive(Debug, Clone)]
pub struct Preimage {
    buf: Vec<u8>,
}

impl Preimage {
    pub fn new(domain: &str) -> Self {
        let mut preimage = Self {
            buf: Vec::with_capacity(128),
        };
        preimage.push(domain.as_bytes());
        preimage
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(bytes);
    }

    pub fn field(mut self, bytes: &[u8]) -> Self {
        self.push(bytes);
        self
    }

    pub fn text(self, value: &str) -> Self {
        self.field(value.as_bytes())
    }

    pub fn u64(self, value: u64) -> Self {
        self.field(&value.to_le_bytes())
    }

    /// An absent digest is framed as an empty field.
    pub fn optional(self, value: Option<&Digest>) -> Self {
        match value {
            Some(digest) => self.field(digest),
            None => self.field(&[]),
        }
    }

    pub fn digest(self, provider: &dyn CryptoProvider) -> Digest {
        provider.digest(&self.buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Drop for Preimage {
    fn drop(&mut self) {
        // Preimages for key derivation carry secret bytes.
        self.buf.zeroize();
    }
}
