//! Endpoint redirection.
//!
//! A redirection candidate comes from the `_iot_endpoint_config` blob in
//! config, or from the `redirect_registry` option. The candidate is checked
//! on every tick:
//!
//! ```text
//! idle -> apply -> final (ok)
//!               -> final (error) -> restore working endpoint | fatal
//! ```
//!
//! A candidate equal to the active endpoint, or to the one last attempted,
//! is ignored.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use sha2::{Digest, Sha256};
use udmi_log::error_chain;
use udmi_schema::{
    BlobBlobsetState, BlobPhase, ClientId, Config, EndpointConfiguration, Entry,
    IOT_ENDPOINT_CONFIG, Level, State, category,
};

use crate::connection::ConnectionError;
use crate::engine::{DeviceDocs, Engine, locked};
use crate::state_sync::StateError;
use crate::storage::StoreError;

pub const DATA_URL_JSON_BASE64: &str = "data:application/json;base64,";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob has no url")]
    MissingUrl,
    #[error("unsupported blob url {0}")]
    UnsupportedUrl(String),
    #[error("blob data is not valid base64")]
    Decode(#[from] base64::DecodeError),
    #[error("blob sha256 mismatch, expected {expected} got {actual}")]
    ShaMismatch { expected: String, actual: String },
    #[error("blob is not an endpoint configuration")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("persisting endpoint")]
    Store(#[from] StoreError),
    /// The working endpoint could not be restored either.
    #[error("While restoring working endpoint")]
    Fatal(#[source] ConnectionError),
}

// ---------------------------------------------------------------------------
// Blob acquisition
// ---------------------------------------------------------------------------

/// Decode a `data:` url and verify its digest against `sha256` (hex).
pub fn acquire_blob_data(url: Option<&str>, sha256: Option<&str>) -> Result<Vec<u8>, BlobError> {
    let url = url.ok_or(BlobError::MissingUrl)?;
    let encoded = url
        .strip_prefix(DATA_URL_JSON_BASE64)
        .ok_or_else(|| BlobError::UnsupportedUrl(url.to_owned()))?;
    let data = BASE64_STANDARD.decode(encoded)?;
    let actual = format!("{:x}", Sha256::digest(&data));
    let expected = sha256.unwrap_or_default().to_ascii_lowercase();
    if actual != expected {
        return Err(BlobError::ShaMismatch { expected, actual });
    }
    Ok(data)
}

fn decode_endpoint(url: Option<&str>, sha256: Option<&str>) -> Result<EndpointConfiguration, BlobError> {
    let data = acquire_blob_data(url, sha256)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Endpoint carried by a final-phase endpoint blob. Acquisition failures
/// come back as an error endpoint.
pub fn extract_endpoint_blob_config(config: &Config) -> Option<EndpointConfiguration> {
    let blob = config.blobset.as_ref()?.blobs.get(IOT_ENDPOINT_CONFIG)?;
    if blob.phase != Some(BlobPhase::Final) {
        return None;
    }
    let mut endpoint = decode_endpoint(blob.url.as_deref(), blob.sha256.as_deref())
        .unwrap_or_else(|e| EndpointConfiguration::from_error(e.to_string()));
    endpoint.generation = blob.generation;
    Some(endpoint)
}

/// `current` with its client id moved to `registry`.
pub fn redirected_endpoint(
    current: &EndpointConfiguration,
    registry: &str,
    iot_project: Option<&str>,
) -> Option<EndpointConfiguration> {
    let client_id = ClientId::parse(current.client_id.as_deref()?)?;
    let mut target = client_id.with_registry(registry);
    if let Some(project) = iot_project {
        target.project = project.to_owned();
    }
    Some(EndpointConfiguration {
        client_id: Some(target.to_string()),
        ..current.clone()
    })
}

fn endpoint_blob_state(state: &mut State) -> &mut BlobBlobsetState {
    state
        .blobset
        .get_or_insert_with(Default::default)
        .blobs
        .entry(IOT_ENDPOINT_CONFIG.to_owned())
        .or_default()
}

fn apply_error_entry(message: String, detail: Option<String>, engine: &Engine) -> Entry {
    Entry::new(category::BLOBSET_BLOB_APPLY, Level::Error, message)
        .with_detail(detail)
        .at(engine.clock.now())
}

// ---------------------------------------------------------------------------
// Engine integration
// ---------------------------------------------------------------------------

impl Engine {
    /// Re-extract the endpoint blob after a config update.
    pub(crate) fn update_endpoint_blob(&self, docs: &mut DeviceDocs) {
        let extracted = extract_endpoint_blob_config(&docs.config);
        if let Some(error) = extracted.as_ref().and_then(|e| e.error.as_deref()) {
            tracing::warn!(error, "endpoint blob not usable");
        }
        locked(&self.redirect).extracted = extracted;
    }

    fn redirect_candidate(&self, current: Option<&EndpointConfiguration>) -> Option<EndpointConfiguration> {
        match &self.config.options.redirect_registry {
            Some(registry) => current.and_then(|c| {
                redirected_endpoint(c, registry, self.config.iot_project.as_deref())
            }),
            None => locked(&self.redirect).extracted.clone(),
        }
    }

    async fn clear_endpoint_blob_state(&self) {
        locked(&self.redirect).attempted = None;
        let mut docs = self.docs.lock().await;
        let Some(blobset) = docs.state.blobset.as_mut() else {
            return;
        };
        if blobset.blobs.remove(IOT_ENDPOINT_CONFIG).is_none() {
            return;
        }
        if blobset.blobs.is_empty() {
            docs.state.blobset = None;
        }
        self.mark_dirty(None);
    }

    pub(crate) async fn maybe_redirect_endpoint(&self) -> Result<(), RedirectError> {
        let current = self.current_endpoint();
        let Some(candidate) = self.redirect_candidate(current.as_ref()) else {
            self.clear_endpoint_blob_state().await;
            return Ok(());
        };

        {
            let mut docs = self.docs.lock().await;
            let blob = endpoint_blob_state(&mut docs.state);
            let attempted = locked(&self.redirect).attempted.clone();
            if current.as_ref() == Some(&candidate) || attempted.as_ref() == Some(&candidate) {
                return Ok(());
            }
            if blob.generation != candidate.generation {
                self.logger.notice("Starting new endpoint generation");
                blob.phase = None;
                blob.status = None;
                blob.generation = candidate.generation;
            }
            locked(&self.redirect).attempted = Some(candidate.clone());

            if let Some(error) = &candidate.error {
                self.logger.error(format!("Endpoint blob error: {error}"));
                blob.phase = Some(BlobPhase::Final);
                blob.status = Some(apply_error_entry(error.clone(), None, self));
                self.mark_dirty(None);
                drop(docs);
                self.publish_sync().await?;
                return Ok(());
            }
            blob.phase = Some(BlobPhase::Apply);
        }

        self.logger.info("New config blob endpoint detected");
        match self.apply_endpoint(&candidate).await {
            Ok(()) => {
                endpoint_blob_state(&mut self.docs.lock().await.state).phase = Some(BlobPhase::Final);
                self.mark_dirty(None);
                Ok(())
            }
            Err(e) => self.restore_working_endpoint(e).await,
        }
    }

    async fn apply_endpoint(&self, candidate: &EndpointConfiguration) -> Result<(), RedirectError> {
        self.publish_sync().await?;
        self.reset_connection(Some(candidate.clone())).await?;
        self.persist_endpoint(candidate)?;
        Ok(())
    }

    fn persist_endpoint(&self, endpoint: &EndpointConfiguration) -> Result<(), StoreError> {
        self.logger.notice("Persisting connection endpoint");
        let mut persistent = locked(&self.persistent);
        persistent.endpoint = Some(endpoint.clone());
        self.store.save(&persistent)
    }

    async fn restore_working_endpoint(&self, failure: RedirectError) -> Result<(), RedirectError> {
        self.logger
            .error_with("Reconfigure failed, attempting connection to last working endpoint", &failure);
        {
            let mut docs = self.docs.lock().await;
            let blob = endpoint_blob_state(&mut docs.state);
            blob.phase = Some(BlobPhase::Final);
            blob.status = Some(apply_error_entry(
                failure.to_string(),
                Some(error_chain(&failure)),
                self,
            ));
        }
        self.mark_dirty(None);

        let working = locked(&self.redirect).working.clone();
        if working.is_none() {
            return Err(RedirectError::Fatal(ConnectionError::NoEndpoint));
        }
        self.reset_connection(working)
            .await
            .map_err(RedirectError::Fatal)?;
        self.publish_async().await;
        self.logger
            .notice("Endpoint connection restored to last working endpoint");
        Ok(())
    }
}
