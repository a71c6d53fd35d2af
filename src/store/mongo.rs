use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Binary};
use chrono::Utc;
use mongodb::{
    options::{ClientOptions, ConnectionString, Tls, TlsOptions, UpdateOptions},
    Client, Collection, Database,
};
use tracing::instrument;

use super::OptionStore;
use crate::types::OptionRow;

const OPTIONS_COLLECTION: &str = "adjutant_options";

/// An implementation of the [`OptionStore`] backed by MongoDB.
///
/// Every option is one document keyed by `name`; writes are upserts.
#[derive(Clone)]
pub struct MongoOptionStore {
    database: Database,
}

impl MongoOptionStore {
    pub async fn new(uri: &str, cert_file: Option<String>) -> Result<Self, mongodb::error::Error> {
        let client = Self::new_client(uri, cert_file, None).await?;
        Ok(Self::with_database(Self::database_for(&client)))
    }

    /// Connect with explicit connect / server-selection timeouts.
    pub async fn with_timeouts(
        uri: &str,
        cert_file: Option<String>,
        connect_timeout: std::time::Duration,
        read_timeout: std::time::Duration,
    ) -> Result<Self, mongodb::error::Error> {
        let client =
            Self::new_client(uri, cert_file, Some((connect_timeout, read_timeout))).await?;
        Ok(Self::with_database(Self::database_for(&client)))
    }

    pub fn with_database(database: Database) -> Self {
        Self { database }
    }

    fn database_for(client: &Client) -> Database {
        client
            .default_database()
            .unwrap_or_else(|| client.database("adjutant"))
    }

    async fn new_client(
        uri: &str,
        cert_path: Option<String>,
        timeouts: Option<(std::time::Duration, std::time::Duration)>,
    ) -> Result<Client, mongodb::error::Error> {
        if cert_path.is_none() && timeouts.is_none() {
            return Client::with_uri_str(uri).await;
        }

        let conn_str = ConnectionString::parse(uri)?;
        let mut options = ClientOptions::parse_connection_string(conn_str).await?;
        if let Some(cert_path) = cert_path {
            let mut tls_options = TlsOptions::default();
            tls_options.ca_file_path = Some(cert_path.into());
            tls_options.allow_invalid_hostnames = Some(true);
            options.tls = Some(Tls::Enabled(tls_options));
        }
        if let Some((connect_timeout, read_timeout)) = timeouts {
            options.connect_timeout = Some(connect_timeout);
            options.server_selection_timeout = Some(read_timeout);
        }
        Client::with_options(options)
    }

    fn collection(&self) -> Collection<OptionRow> {
        self.database.collection(OPTIONS_COLLECTION)
    }
}

#[async_trait]
impl OptionStore for MongoOptionStore {
    #[instrument(skip(self), err)]
    async fn get_option(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row = self
            .collection()
            .find_one(doc! { "name": name }, None)
            .await
            .context("Failed to read option")?;
        Ok(row.map(|row| row.value.bytes))
    }

    #[instrument(skip(self, value), err, fields(value_size = value.len()))]
    async fn update_option(&self, name: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let value = Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: value,
        };
        let update_doc = doc! {
            "$set": {
                "value": value,
                "updated_at": bson::DateTime::from_millis(Utc::now().timestamp_millis()),
            }
        };
        let update_options = UpdateOptions::builder().upsert(true).build();

        self.collection()
            .update_one(doc! { "name": name }, update_doc, update_options)
            .await
            .context("Failed to write option")?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_option(&self, name: &str) -> anyhow::Result<bool> {
        let result = self
            .collection()
            .delete_one(doc! { "name": name }, None)
            .await
            .context("Failed to delete option")?;
        Ok(result.deleted_count > 0)
    }
}

impl std::fmt::Debug for MongoOptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoOptionStore")
            .field("database", &self.database.name())
            .finish()
    }
}
