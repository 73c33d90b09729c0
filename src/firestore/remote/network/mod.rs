use std::sync::Arc;

use crate::firestore::credentials::{CredentialsProviderArc, User};
use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::datastore::{StreamHandle, StreamingDatastore};
use crate::firestore::remote::stream::{StreamHeaders, StreamKind};

pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub user: User,
}

impl StreamCredentials {
    fn headers(&self, database_name: &str) -> StreamHeaders {
        let mut headers = StreamHeaders::new();
        headers.insert(RESOURCE_PREFIX_HEADER.to_string(), database_name.to_string());
        if let Some(token) = &self.auth_token {
            headers.insert(AUTHORIZATION_HEADER.to_string(), format!("Bearer {token}"));
        }
        headers
    }
}

/// Opens authenticated streams against a [`StreamingDatastore`].
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    credentials: CredentialsProviderArc,
    database_name: String,
}

impl NetworkLayer {
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        credentials: CredentialsProviderArc,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            datastore,
            credentials,
            database_name: database_name.into(),
        }
    }

    pub async fn fetch_credentials(&self) -> FirestoreResult<StreamCredentials> {
        let token = self.credentials.get_token().await?;
        Ok(match token {
            Some(token) => StreamCredentials {
                auth_token: Some(token.value),
                user: token.user,
            },
            None => StreamCredentials::default(),
        })
    }

    pub async fn open(&self, kind: StreamKind) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let credentials = self.fetch_credentials().await?;
        log::debug!(
            "opening {} stream as {}",
            kind.label(),
            credentials.user
        );
        self.datastore
            .open_stream(kind.method(), credentials.headers(&self.database_name))
            .await
    }

    /// Forces the next open to fetch a fresh token.
    pub fn invalidate_credentials(&self) {
        self.credentials.invalidate_token();
    }
}
