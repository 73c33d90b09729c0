use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// Identity that owns a mutation queue. Unauthenticated writes are queued
/// under an anonymous user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which per-user local state is stored.
    pub fn to_key(&self) -> String {
        match &self.uid {
            Some(uid) => format!("uid:{uid}"),
            None => "anonymous-user".to_string(),
        }
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{uid}"),
            None => write!(f, "<anonymous>"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

/// Supplies auth tokens for stream handshakes.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<Token>>;

    /// Forces the next `get_token` to fetch a fresh token, called after the
    /// backend answered `Unauthenticated`.
    fn invalidate_token(&self);
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

#[derive(Clone, Debug, Default)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

/// Fixed token for one user. Counts invalidations so callers can observe
/// token refreshes.
#[derive(Debug)]
pub struct StaticCredentialsProvider {
    token: Token,
    invalidations: AtomicUsize,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, value: impl Into<String>) -> Self {
        Self {
            token: Token {
                value: value.into(),
                user,
            },
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(Some(self.token.clone()))
    }

    fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
