use std::sync::Arc;

use object_store::{
    aws::AmazonS3Builder, azure::MicrosoftAzureBuilder, gcp::GoogleCloudStorageBuilder,
};
use tracing::debug;

use crate::snapstore::{
    LocalSnapStore, ObjectSnapStore, Provider, SnapStore, SnapStoreError, StoreConfig,
};

/// Base directory used by the `Local` provider when no container is configured.
pub const DEFAULT_LOCAL_CONTAINER: &str = "default.bkp";

/// Build the store selected by `config.provider`.
///
/// Object-store credentials and endpoints come from the provider's usual environment
/// variables (`AWS_*`, `AZURE_*`, `GOOGLE_*`); no connection is made here.
pub fn new_snap_store(config: &StoreConfig) -> Result<Arc<dyn SnapStore>, SnapStoreError> {
    let provider: Provider = config
        .provider
        .parse()
        .map_err(|reason| SnapStoreError::Configuration { reason })?;
    let container = config.container.trim();

    debug!(provider = %provider, container = %container, prefix = %config.prefix, "building snapstore");

    if provider != Provider::Local && container.is_empty() {
        return Err(SnapStoreError::Configuration {
            reason: format!("storage container is required for provider {provider}"),
        });
    }

    let backend: Arc<dyn object_store::ObjectStore> = match provider {
        Provider::Local => {
            let container = if container.is_empty() {
                DEFAULT_LOCAL_CONTAINER
            } else {
                container
            };
            return Ok(Arc::new(LocalSnapStore::new(container, &config.prefix)));
        }
        Provider::S3 => Arc::new(
            AmazonS3Builder::from_env()
                .with_bucket_name(container)
                .build()
                .map_err(|e| build_err(provider, e))?,
        ),
        Provider::Abs => Arc::new(
            MicrosoftAzureBuilder::from_env()
                .with_container_name(container)
                .build()
                .map_err(|e| build_err(provider, e))?,
        ),
        Provider::Gcs => Arc::new(
            GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(container)
                .build()
                .map_err(|e| build_err(provider, e))?,
        ),
    };

    Ok(Arc::new(ObjectSnapStore::new(
        provider,
        backend,
        &config.prefix,
    )?))
}

fn build_err(provider: Provider, err: object_store::Error) -> SnapStoreError {
    SnapStoreError::Configuration {
        reason: format!("{provider}: {err}"),
    }
}
