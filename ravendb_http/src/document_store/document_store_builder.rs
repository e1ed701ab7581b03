use std::{fs::File, io::Read, sync::Arc};

use reqwest::Url;
use tracing::instrument;

use crate::{
    changes::DatabaseChangesConnector, document_conventions::DocumentConventions,
    http_client::build_http_client, DnsOverrides, DocumentStore, DocumentStoreError,
    DocumentStoreInitialConfiguration,
};

#[derive(Debug, Default)]
pub struct DocumentStoreBuilder {
    changes_connector: Option<Arc<dyn DatabaseChangesConnector>>,
    client_certificate_path: Option<String>,
    conventions: DocumentConventions,
    database_name: Option<String>,
    dns_overrides: Option<DnsOverrides>,
    document_store_urls: Vec<String>,
    proxy_address: Option<String>,
}

impl DocumentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dns_overrides(mut self, overrides: DnsOverrides) -> Self {
        tracing::trace!("Adding to dns_overrides: {:?}", &overrides);
        self.dns_overrides = Some(overrides);
        self
    }

    pub fn set_client_certificate(mut self, certificate_path: &str) -> Self {
        self.client_certificate_path = Some(certificate_path.to_string());
        self
    }

    pub fn set_proxy_address(mut self, proxy_address: &str) -> Self {
        self.proxy_address = Some(proxy_address.to_string());
        self
    }

    pub fn set_urls<T>(mut self, urls: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for u in urls {
            self.document_store_urls.push(u.as_ref().to_string());
        }
        self
    }

    pub fn set_database_name(mut self, database_name: &str) -> Self {
        self.database_name = Some(database_name.to_string());
        self
    }

    pub fn set_conventions(mut self, conventions: DocumentConventions) -> Self {
        self.conventions = conventions;
        self
    }

    /// Source of change notifications used to evict aggressively cached responses.
    pub fn set_changes_connector(mut self, connector: Arc<dyn DatabaseChangesConnector>) -> Self {
        self.changes_connector = Some(connector);
        self
    }

    /// Initializes a new [`DocumentStoreActor`](crate::DocumentStoreActor) and retuns a handle
    /// to it.
    ///
    /// Each call to this will create a new actor and return a new handle to it. It is not
    /// recommended to create more that one per database cluster. This function is allowed to be
    /// called more than once so the builder can act as a template after being set up once.
    /// Must be called from within a tokio runtime.
    #[instrument(level = "debug", name = "Build DocumentStoreBuilder", skip(self))]
    pub fn build(&self) -> Result<DocumentStore, DocumentStoreError> {
        // Ensure DocumentStore URLs are valid and there is at least one
        if self.document_store_urls.is_empty() {
            tracing::error!(
                "No URLs were supplied and a document store can't exist without at least one"
            );
            return Err(DocumentStoreError::MissingUrlsError);
        }

        let initial_urls = validate_urls(
            self.document_store_urls.as_slice(),
            self.client_certificate_path.is_some(),
        )?;

        let identity = match &self.client_certificate_path {
            Some(certpath) => Some(read_identity(certpath)?),
            None => None,
        };

        let http_client = build_http_client(
            identity,
            self.dns_overrides.as_ref(),
            self.proxy_address.as_deref(),
        )?;

        // Create an initial configuration for the DocumentStoreActor
        let initial_config = DocumentStoreInitialConfiguration {
            changes_connector: self.changes_connector.clone(),
            conventions: self.conventions.clone(),
            database_name: self.database_name.clone(),
            http_client,
            initial_urls,
        };

        tracing::trace!("Initial Configuration: {:?}", &initial_config);

        Ok(DocumentStore::new(initial_config))
    }
}

/// Opens and validates a PEM certificate, and creates an identity from it.
fn read_identity(certpath: &str) -> anyhow::Result<reqwest::Identity> {
    let mut buf = Vec::new();
    File::open(certpath)
        .map_err(|e| {
            let err = anyhow::anyhow!("Failed to open certificate file. Caused by: {}", e);
            tracing::error!("{}", &err);
            err
        })?
        .read_to_end(&mut buf)
        .map_err(|e| {
            let err = anyhow::anyhow!("File was opened but unable to read. Caused by: {}", e);
            tracing::error!("{}", err);
            err
        })?;
    reqwest::Identity::from_pem(&buf).map_err(|e| {
        let err = anyhow::anyhow!("Invalid pem file. Caused by: {}", e);
        tracing::error!("{}", err);
        err
    })
}

/// Parses the provided URL strings, ensuring they are a valid format, and returns them without
/// a trailing slash, in the order given and without duplicates.
///
/// Also ensures all provided URL strings use the same scheme: either https or http, but never
/// both within the list. A client certificate requires https.
#[instrument(level = "debug", name = "Validate URLs")]
fn validate_urls<T: std::fmt::Debug>(urls: &[T], require_https: bool) -> anyhow::Result<Vec<String>>
where
    T: AsRef<str>,
{
    let mut clean_urls: Vec<String> = Vec::with_capacity(urls.len());
    let mut scheme: Option<String> = None;

    for url in urls {
        let parsed = Url::parse(url.as_ref()).map_err(|e| {
            anyhow::anyhow!("`{}` is not a valid url. Caused by: {}", url.as_ref(), e)
        })?;

        if require_https && parsed.scheme() != "https" {
            return Err(anyhow::anyhow!(
                "Url does not have correct scheme: {}. A client certificate requires https",
                parsed
            ));
        }
        match &scheme {
            Some(expected) if expected != parsed.scheme() => {
                return Err(anyhow::anyhow!(
                    "Url does not have correct scheme: {}. All urls must use `{}`",
                    parsed,
                    expected
                ));
            }
            Some(_) => {}
            None => scheme = Some(parsed.scheme().to_string()),
        }

        let clean = parsed.as_str().trim_end_matches('/').to_string();
        if !clean_urls.contains(&clean) {
            clean_urls.push(clean);
        }
    }

    Ok(clean_urls)
}
