use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::store::{MediaRecord, NewMedia};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

/// Media upload bookkeeping. File bytes go to the media host, not this socket.
pub struct MediaModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    file_size: i64,
    #[serde(default)]
    file_type: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaRequest {
    media_id: i64,
}

/// Encode a client-supplied file name as a single URL path segment.
fn path_segment(file_name: &str) -> String {
    if file_name.chars().all(|c| c == '.') {
        return file_name.replace('.', "%2E");
    }
    urlencoding::encode(file_name).into_owned()
}

impl MediaModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    fn base_url(&self) -> &str {
        self.ctx.state.gateway.media_base_url.trim_end_matches('/')
    }

    async fn load(&self, media_id: i64) -> Result<MediaRecord, ActionError> {
        self.ctx
            .state
            .store
            .media(media_id)
            .await?
            .ok_or_else(|| ActionError::not_found("Media not found"))
    }

    async fn upload_request(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: UploadRequest = call.parse()?;
        if req.file_name.trim().is_empty() || req.file_type.trim().is_empty() || req.file_size <= 0 {
            return Err(ActionError::invalid_input("File details required"));
        }

        let media = self
            .ctx
            .state
            .store
            .create_media(
                self.ctx.user_id(),
                NewMedia {
                    file_name: req.file_name,
                    file_size: req.file_size,
                    file_type: req.file_type,
                    mime_type: req.mime_type,
                },
            )
            .await?;
        let upload_url = format!("{}/upload/{}", self.base_url(), media.id);

        Ok(Reply::Success(json!({
            "upload": {
                "media_id": media.id,
                "upload_url": upload_url,
                "file_name": media.file_name,
                "file_size": media.file_size,
                "file_type": media.file_type,
                "mime_type": media.mime_type,
            }
        })))
    }

    async fn upload_complete(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: MediaRequest = call.parse()?;
        let media = self.load(req.media_id).await?;
        if media.owner_id != self.ctx.user_id() {
            return Err(ActionError::unauthorized("Not the media owner"));
        }
        self.ctx.state.store.mark_media_uploaded(media.id).await?;
        Ok(Reply::Success(json!({ "media_id": media.id })))
    }

    async fn download_request(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: MediaRequest = call.parse()?;
        let media = self.load(req.media_id).await?;
        if !media.uploaded {
            return Err(ActionError::invalid_input("Media upload is not complete"));
        }
        let download_url = format!("{}/{}/{}", self.base_url(), media.id, path_segment(&media.file_name));
        Ok(Reply::Success(json!({ "media_id": media.id, "download_url": download_url })))
    }
}

#[async_trait]
impl Module for MediaModule {
    fn key(&self) -> &'static str {
        "media"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("upload_request", Self::upload_request)
            .action("upload_complete", Self::upload_complete)
            .action("download_request", Self::download_request);
    }
}
