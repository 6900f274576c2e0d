use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use paralon_contracts::assets::{AssetOrigin, ImageAsset};
use paralon_contracts::constraints::{BlendParams, ConstraintResolver, RemoteParams, ResolvedParams};
use paralon_contracts::requests::{GenerationRequest, ImageRef, Operation, RequestImages};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compositor::{CompositeSpec, StyleCompositor};
use crate::remote::{InputImage, RemoteError, RemoteImage, RemoteImages, RemoteInputs};
use crate::store::{sniff_mime, ImageStore, StorageError};
use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    DispatchedRemote,
    Composited,
    Persisted,
    Responded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::DispatchedRemote => "dispatched_remote",
            Stage::Composited => "composited",
            Stage::Persisted => "persisted",
            Stage::Responded => "responded",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub request_id: Uuid,
    pub operation: Operation,
    pub assets: Vec<ImageAsset>,
}

impl OperationOutcome {
    pub fn public_paths(&self) -> Vec<String> {
        self.assets.iter().map(ImageAsset::public_path).collect()
    }
}

/// Drives one request from validation to persisted outputs. Shared across
/// handlers; holds no per-request state.
pub struct Orchestrator {
    resolver: ConstraintResolver,
    remote: Arc<dyn RemoteImages>,
    store: ImageStore,
    compositor: StyleCompositor,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("remote", &self.remote.name())
            .field("store", &self.store)
            .finish()
    }
}

struct RequestTrace {
    request_id: Uuid,
    operation: Operation,
    stage: Stage,
}

impl RequestTrace {
    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        debug!(
            request_id = %self.request_id,
            operation = %self.operation,
            stage = %stage,
            "request advanced"
        );
    }

    fn fail(&self, err: EngineError) -> EngineError {
        warn!(
            request_id = %self.request_id,
            operation = %self.operation,
            stage = %self.stage,
            error = %err,
            "request errored"
        );
        err
    }
}

impl Orchestrator {
    pub fn new(
        resolver: ConstraintResolver,
        remote: Arc<dyn RemoteImages>,
        store: ImageStore,
    ) -> Self {
        Self {
            resolver,
            remote,
            compositor: StyleCompositor::new(store.clone()),
            store,
        }
    }

    pub fn remote_name(&self) -> &str {
        self.remote.name()
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub async fn handle(
        &self,
        request: GenerationRequest,
    ) -> Result<OperationOutcome, EngineError> {
        let mut trace = RequestTrace {
            request_id: Uuid::new_v4(),
            operation: request.operation(),
            stage: Stage::Received,
        };
        trace.advance(Stage::Received);

        let resolved = self
            .resolver
            .resolve_request(&request)
            .map_err(|err| trace.fail(err.into()))?;
        trace.advance(Stage::Validated);

        let images = request.into_images();
        let assets = match resolved {
            ResolvedParams::Remote(params) => {
                let outputs = self
                    .dispatch_remote(&params, images)
                    .await
                    .map_err(|err| trace.fail(err))?;
                trace.advance(Stage::DispatchedRemote);
                self.persist_all(outputs)
                    .await
                    .map_err(|err| trace.fail(err))?
            }
            ResolvedParams::StyleTransfer(blend) => {
                let asset = self
                    .style_transfer(blend, images)
                    .await
                    .map_err(|err| trace.fail(err))?;
                trace.advance(Stage::Composited);
                vec![asset]
            }
        };
        trace.advance(Stage::Persisted);

        info!(
            request_id = %trace.request_id,
            operation = %trace.operation,
            backend = self.remote.name(),
            images = assets.len(),
            "request completed"
        );
        trace.advance(Stage::Responded);
        Ok(OperationOutcome {
            request_id: trace.request_id,
            operation: trace.operation,
            assets,
        })
    }

    async fn dispatch_remote(
        &self,
        params: &RemoteParams,
        images: RequestImages,
    ) -> Result<Vec<RemoteImage>, EngineError> {
        let inputs = RemoteInputs {
            image: self.stage_input(images.image).await?,
            mask: self.stage_input(images.mask).await?,
        };
        let outputs = self.remote.invoke(params, &inputs).await?;
        if outputs.len() != params.n as usize {
            return Err(RemoteError::InvalidResponse {
                operation: params.operation.label(),
                message: format!("expected {} images, got {}", params.n, outputs.len()),
            }
            .into());
        }
        Ok(outputs)
    }

    async fn style_transfer(
        &self,
        blend: BlendParams,
        images: RequestImages,
    ) -> Result<ImageAsset, EngineError> {
        let (Some(base), Some(style)) = (images.base_image, images.style_image) else {
            return Err(EngineError::Internal(
                "style transfer reached staging without both images".to_string(),
            ));
        };
        let base = self.stage(base).await?;
        let style = self.stage(style).await?;
        let spec = CompositeSpec::new(base, style, blend.alpha)?;
        Ok(self.compositor.composite(spec).await?)
    }

    async fn stage_input(&self, slot: Option<ImageRef>) -> Result<Option<InputImage>, EngineError> {
        let Some(image) = slot else {
            return Ok(None);
        };
        let asset = self.stage(image).await?;
        Ok(Some(InputImage {
            file_name: asset.file_name(),
            mime_type: asset.mime_type,
            bytes: asset.bytes,
        }))
    }

    /// Uploads are written to the staging directory; stored refs are looked
    /// up in either directory.
    async fn stage(&self, image: ImageRef) -> Result<ImageAsset, EngineError> {
        match image {
            ImageRef::Upload(upload) => {
                let mime = sniff_mime(&upload.bytes, upload.mime_type.as_deref());
                Ok(self
                    .store
                    .put(upload.bytes, &mime, AssetOrigin::Uploaded)
                    .await?)
            }
            ImageRef::Stored(id) => Ok(self.store.get(id.as_str()).await?),
            ImageRef::Unknown(raw) => Err(EngineError::NotFound(raw)),
        }
    }

    /// All-or-nothing: if any output fails to persist, the ones that did are
    /// removed again and the first error is returned.
    async fn persist_all(&self, outputs: Vec<RemoteImage>) -> Result<Vec<ImageAsset>, EngineError> {
        let writes = outputs.into_iter().map(|output| {
            let mime = sniff_mime(&output.bytes, output.mime_type.as_deref());
            let store = self.store.clone();
            async move {
                store
                    .put(output.bytes, &mime, AssetOrigin::Generated)
                    .await
            }
        });
        let results = join_all(writes).await;
        self.keep_all_or_none(results).await
    }

    async fn keep_all_or_none(
        &self,
        results: Vec<Result<ImageAsset, StorageError>>,
    ) -> Result<Vec<ImageAsset>, EngineError> {
        let mut stored = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(asset) => stored.push(asset),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(_) => {}
            }
        }
        let Some(err) = first_error else {
            return Ok(stored);
        };
        for asset in &stored {
            if let Err(cleanup) = self.store.discard(asset).await {
                warn!(asset_id = %asset.id, error = %cleanup, "failed to roll back output");
            }
        }
        Err(err.into())
    }
}
