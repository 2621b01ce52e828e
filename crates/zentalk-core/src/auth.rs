//! Session token authentication
//!
//! Provides:
//! - Bearer token issuance, validation, and revocation
//! - SHA-256 hash storage (raw tokens are never kept)
//! - Constant-time token comparison

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credentials provided
    #[error("Authentication required")]
    MissingCredentials,

    /// Invalid token
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Token has been revoked
    #[error("Token revoked")]
    TokenRevoked,

    /// Internal error
    #[error("Auth internal error: {0}")]
    Internal(String),
}

/// Auth result type
pub type Result<T> = std::result::Result<T, AuthError>;

// ============================================================================
// Auth Context
// ============================================================================

/// Authenticated context attached to each request
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Owning user of the validated token
    pub user_id: i64,
}

// ============================================================================
// Stored Token
// ============================================================================

/// Internal representation of a stored session token
#[derive(Debug, Clone)]
struct StoredToken {
    /// SHA-256 hash of the token (we never store the raw token)
    token_hash: [u8; 32],
    /// User ID this token belongs to
    user_id: i64,
    /// Human-readable label
    label: String,
    /// When the token was issued
    created_at: DateTime<Utc>,
    /// Whether the token has been revoked
    revoked: bool,
}

// ============================================================================
// Auth Store
// ============================================================================

/// Token storage and validation
pub struct AuthStore {
    /// token_hash_hex → StoredToken
    tokens: RwLock<HashMap<String, StoredToken>>,
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStore {
    /// Create a new auth store
    #[must_use]
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Hash a token using SHA-256
    fn hash_token(token: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }

    /// Convert hash to hex string for map lookup
    fn hash_to_hex(hash: &[u8; 32]) -> String {
        hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Issue a new session token for a user
    ///
    /// Returns the raw token (only shown once) and the token hash for
    /// later revocation.
    pub fn issue_token(&self, user_id: i64, label: &str) -> Result<(String, String)> {
        // Random token: zt_<uuid>
        let raw_token = format!("zt_{}", Uuid::new_v4().as_simple());
        let token_hash = Self::hash_token(&raw_token);
        let token_hash_hex = Self::hash_to_hex(&token_hash);

        let stored = StoredToken {
            token_hash,
            user_id,
            label: label.to_string(),
            created_at: Utc::now(),
            revoked: false,
        };

        let mut tokens = self
            .tokens
            .write()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;
        tokens.insert(token_hash_hex.clone(), stored);

        info!(
            user_id = user_id,
            label = %label,
            token_prefix = %&raw_token[..8],
            "Session token issued"
        );

        Ok((raw_token, token_hash_hex))
    }

    /// Validate a token and return the auth context
    pub fn validate_token(&self, token: &str) -> Result<AuthContext> {
        if token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let token_hash = Self::hash_token(token);
        let token_hash_hex = Self::hash_to_hex(&token_hash);

        let tokens = self
            .tokens
            .read()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;

        if let Some(stored) = tokens.get(&token_hash_hex) {
            // Constant-time comparison of the hash
            let hashes_match: bool = stored.token_hash.ct_eq(&token_hash).into();
            if !hashes_match {
                return Err(AuthError::InvalidCredentials);
            }

            if stored.revoked {
                return Err(AuthError::TokenRevoked);
            }

            debug!(user_id = stored.user_id, label = %stored.label, "Token validated");

            Ok(AuthContext {
                user_id: stored.user_id,
            })
        } else {
            warn!("Invalid token attempt");
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Revoke a token by its hash
    pub fn revoke_token(&self, token_hash_hex: &str) -> Result<()> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;

        if let Some(stored) = tokens.get_mut(token_hash_hex) {
            stored.revoked = true;
            info!(
                user_id = stored.user_id,
                label = %stored.label,
                "Session token revoked"
            );
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    /// List all tokens (non-sensitive info only)
    pub fn list_tokens(&self) -> Result<Vec<TokenInfo>> {
        let tokens = self
            .tokens
            .read()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;

        Ok(tokens
            .iter()
            .map(|(hash_hex, stored)| TokenInfo {
                token_hash: hash_hex.clone(),
                user_id: stored.user_id,
                label: stored.label.clone(),
                created_at: stored.created_at,
                revoked: stored.revoked,
            })
            .collect())
    }

    /// Get count of active (non-revoked) tokens
    pub fn active_token_count(&self) -> usize {
        self.tokens
            .read()
            .map(|tokens| tokens.values().filter(|t| !t.revoked).count())
            .unwrap_or(0)
    }
}

/// Non-sensitive token information for listing
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    /// Hash of the token (for identification/revocation)
    pub token_hash: String,
    /// Owner user ID
    pub user_id: i64,
    /// Human-readable label
    pub label: String,
    /// Issuance time
    pub created_at: DateTime<Utc>,
    /// Whether revoked
    pub revoked: bool,
}

// ============================================================================
// Tests
// ============================================================================
