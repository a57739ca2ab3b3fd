//! BitChat Network - Network Descriptors
//!
//! Derives the `(network_id, network_secret)` pair for a chat:
//! - Group chats: from the chat name and shared secret
//! - Private chats: from both peers' email hashes and the shared secret
//!
//! Every derivation is PBKDF2-HMAC-SHA256 with a fixed, per-purpose salt so
//! that independent peers agree on the output while different purposes never
//! collide. The chat name and emails never leave the node in cleartext.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identifier::{Identifier, NETWORK_ID_LEN, NETWORK_SECRET_LEN};

// =============================================================================
// Constants
// =============================================================================

/// KDF rounds for every derivation
pub const KDF_ITERATIONS: u32 = 10_000;

/// Length of email hashes and masks
pub const EMAIL_HASH_LEN: usize = 20;

const SALT_NETWORK_ID: &[u8] = b"bitchat/v1/network-id";
const SALT_NETWORK_SECRET: &[u8] = b"bitchat/v1/network-secret";
const SALT_EMAIL_HASH: &[u8] = b"bitchat/v1/email-hash";
const SALT_EMAIL_MASK: &[u8] = b"bitchat/v1/email-mask";

// =============================================================================
// Network Type
// =============================================================================

/// Kind of chat a network belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkType {
    /// Named group chat
    Group,
    /// One-to-one chat between two email identities
    Private,
}

// =============================================================================
// Derivation helpers
// =============================================================================

fn derive(password: &[u8], salt_prefix: &[u8], salt_body: &[u8], len: usize) -> Identifier {
    let mut salt = Vec::with_capacity(salt_prefix.len() + salt_body.len());
    salt.extend_from_slice(salt_prefix);
    salt.extend_from_slice(salt_body);

    let mut out = vec![0u8; len];
    pbkdf2_hmac::<Sha256>(password, &salt, KDF_ITERATIONS, &mut out);
    let id = Identifier::new(out.clone()).expect("derived lengths are below 255");
    out.zeroize();
    id
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Salted hash of an email, used as a lookup key
pub fn hash_email(email: &str) -> Identifier {
    derive(normalize_email(email).as_bytes(), SALT_EMAIL_HASH, &[], EMAIL_HASH_LEN)
}

/// Second salted hash of an email, not linkable to [`hash_email`]
pub fn mask_email(email: &str) -> Identifier {
    derive(normalize_email(email).as_bytes(), SALT_EMAIL_MASK, &[], EMAIL_HASH_LEN)
}

/// Network ID of a group chat
pub fn group_network_id(chat_name: &str, shared_secret: &str) -> Identifier {
    let name = chat_name.trim().to_lowercase();
    derive(shared_secret.as_bytes(), SALT_NETWORK_ID, name.as_bytes(), NETWORK_ID_LEN)
}

/// Network ID of a private chat; symmetric in the two emails
pub fn private_network_id(email_a: &str, email_b: &str, shared_secret: &str) -> Identifier {
    let pair = &hash_email(email_a) ^ &hash_email(email_b);
    derive(shared_secret.as_bytes(), SALT_NETWORK_ID, pair.as_bytes(), NETWORK_ID_LEN)
}

fn network_secret(network_id: &Identifier, shared_secret: &str) -> Identifier {
    derive(
        shared_secret.as_bytes(),
        SALT_NETWORK_SECRET,
        network_id.as_bytes(),
        NETWORK_SECRET_LEN,
    )
}

// =============================================================================
// Network Descriptor
// =============================================================================

/// Derived identity of one chat network. Never transmitted in cleartext.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NetworkDescriptor {
    #[zeroize(skip)]
    network_type: NetworkType,
    #[zeroize(skip)]
    network_id: Identifier,
    secret: Vec<u8>,
    /// Chat name (group) or remote peer email (private)
    #[zeroize(skip)]
    label: String,
}

impl NetworkDescriptor {
    /// Descriptor for a group chat
    pub fn group(chat_name: &str, shared_secret: &str) -> Self {
        let network_id = group_network_id(chat_name, shared_secret);
        let secret = network_secret(&network_id, shared_secret);
        Self {
            network_type: NetworkType::Group,
            network_id,
            secret: secret.as_bytes().to_vec(),
            label: chat_name.to_string(),
        }
    }

    /// Descriptor for a private chat between `local_email` and `peer_email`
    pub fn private(local_email: &str, peer_email: &str, shared_secret: &str) -> Self {
        let network_id = private_network_id(local_email, peer_email, shared_secret);
        let secret = network_secret(&network_id, shared_secret);
        Self {
            network_type: NetworkType::Private,
            network_id,
            secret: secret.as_bytes().to_vec(),
            label: peer_email.to_string(),
        }
    }

    /// Recompute the descriptor for a changed shared secret
    pub fn with_shared_secret(&self, local_email: &str, shared_secret: &str) -> Self {
        match self.network_type {
            NetworkType::Group => Self::group(&self.label, shared_secret),
            NetworkType::Private => Self::private(local_email, &self.label, shared_secret),
        }
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn network_id(&self) -> &Identifier {
        &self.network_id
    }

    /// Pre-shared secret handed to the secure channel
    pub fn network_secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for NetworkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDescriptor")
            .field("network_type", &self.network_type)
            .field("network_id", &self.network_id.short())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
