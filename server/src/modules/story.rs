//! Ephemeral stories shared with contacts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::store::{NewStory, StoryRecord};
use crate::ws::{user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

/// Stories older than this are no longer returned by `fetch`.
const STORY_LIFETIME_HOURS: i64 = 24;

pub struct StoryModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct PostRequest {
    #[serde(default)]
    media_id: Option<i64>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default = "default_media_type")]
    media_type: String,
}

fn default_media_type() -> String {
    "image".to_string()
}

#[derive(Debug, Deserialize)]
struct StoryRequest {
    story_id: i64,
}

impl StoryModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn load(&self, story_id: i64) -> Result<StoryRecord, ActionError> {
        self.ctx
            .state
            .store
            .story(story_id)
            .await?
            .ok_or_else(|| ActionError::not_found("Story not found"))
    }

    async fn post(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: PostRequest = call.parse()?;
        let me = self.ctx.user_id();
        let store = &self.ctx.state.store;

        let caption = req.caption.filter(|c| !c.trim().is_empty());
        if req.media_id.is_none() && caption.is_none() {
            return Err(ActionError::invalid_input("Story needs media or a caption"));
        }
        if let Some(media_id) = req.media_id {
            let media = store
                .media(media_id)
                .await?
                .ok_or_else(|| ActionError::not_found("Media not found"))?;
            if media.owner_id != me {
                return Err(ActionError::unauthorized("Not the media owner"));
            }
        }

        let story = store
            .create_story(
                me,
                NewStory {
                    media_id: req.media_id,
                    caption,
                    media_type: req.media_type,
                },
            )
            .await?;

        for viewer in store.contact_of_ids(me).await? {
            self.ctx.publish(
                &user_group(viewer),
                BroadcastAction::StoryNew,
                json!({ "story": story, "user_id": me }),
            );
        }
        Ok(Reply::Success(json!({ "story": story })))
    }

    async fn view(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: StoryRequest = call.parse()?;
        let story = self.load(req.story_id).await?;
        let me = self.ctx.user_id();

        if story.user_id != me {
            self.ctx.state.store.mark_story_viewed(story.id, me).await?;
            self.ctx.publish(
                &user_group(story.user_id),
                BroadcastAction::StoryViewed,
                json!({ "story_id": story.id, "viewer_id": me }),
            );
        }
        Ok(Reply::Success(json!({ "story_id": story.id })))
    }

    async fn delete(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: StoryRequest = call.parse()?;
        let story = self.load(req.story_id).await?;
        let me = self.ctx.user_id();
        if story.user_id != me {
            return Err(ActionError::unauthorized("Cannot delete story"));
        }

        let store = &self.ctx.state.store;
        store.delete_story(story.id).await?;
        for viewer in store.contact_of_ids(me).await? {
            self.ctx.publish(
                &user_group(viewer),
                BroadcastAction::StoryDeleted,
                json!({ "story_id": story.id, "user_id": me }),
            );
        }
        Ok(Reply::Success(json!({ "story_id": story.id })))
    }

    async fn fetch(self: Arc<Self>, _call: ActionCall) -> ActionResult {
        let since = (Utc::now() - Duration::hours(STORY_LIFETIME_HOURS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let stories = self
            .ctx
            .state
            .store
            .contact_stories(self.ctx.user_id(), &since)
            .await?;
        Ok(Reply::Success(json!({ "stories": stories })))
    }
}

#[async_trait]
impl Module for StoryModule {
    fn key(&self) -> &'static str {
        "story"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("post", Self::post)
            .action("view", Self::view)
            .action("delete", Self::delete)
            .action("fetch", Self::fetch);
    }
}
