//! Moderation plugin: contributes moderator tags to the shared context and
//! flags stored content that contains configured terms.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{keys, ContentKind, KvStore, KvStoreExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use services::plugins::{ContextDelta, PluginDescriptor, PluginFactory, PluginInstance, PluginRequest, SharedContext};
use services::PluginError;
use tracing::{info, warn};

pub const PLUGIN_NAME: &str = "moderation";
pub const FLAG_PREFIX: &str = "moderation-flag-";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModerationConfig {
    /// Rendered signature tags granted moderator rights.
    pub moderators: Vec<String>,
    /// Case-insensitive terms that flag a submission.
    pub banned_terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub kind: ContentKind,
    pub id: u64,
    pub term: String,
    pub flagged_at: DateTime<Utc>,
}

pub fn flag_key(id: u64) -> String {
    format!("{FLAG_PREFIX}{id}")
}

#[derive(Default)]
pub struct ModerationFactory;

#[async_trait]
impl PluginFactory for ModerationFactory {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn init(
        &self,
        descriptor: &PluginDescriptor,
        _context: &mut SharedContext,
        store: Arc<dyn KvStore>,
    ) -> Result<Arc<dyn PluginInstance>, PluginError> {
        let mut config: ModerationConfig = match &descriptor.config {
            Value::Null => ModerationConfig::default(),
            value => serde_json::from_value(value.clone()).map_err(|e| PluginError::Init {
                plugin: descriptor.id().to_string(),
                reason: e.to_string(),
            })?,
        };
        config.banned_terms = config
            .banned_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        info!(
            moderators = config.moderators.len(),
            terms = config.banned_terms.len(),
            "moderation plugin ready"
        );
        Ok(Arc::new(Moderation { config, store }))
    }
}

struct Moderation {
    config: ModerationConfig,
    store: Arc<dyn KvStore>,
}

impl Moderation {
    async fn stored_body(&self, kind: ContentKind, id: u64) -> Result<Option<String>, PluginError> {
        let key = match kind {
            ContentKind::Thread => keys::thread(id),
            ContentKind::Post => keys::post(id),
        };
        let record: Option<Value> = self.store.get_as(&key).await?;
        Ok(record.and_then(|r| r.get("body").and_then(Value::as_str).map(str::to_string)))
    }

    fn first_match(&self, body: &str) -> Option<&str> {
        let body = body.to_lowercase();
        self.config
            .banned_terms
            .iter()
            .find(|term| body.contains(term.as_str()))
            .map(String::as_str)
    }
}

#[async_trait]
impl PluginInstance for Moderation {
    fn context(&self, _context: &SharedContext) -> ContextDelta {
        ContextDelta::default().with_moderators(self.config.moderators.iter().cloned())
    }

    async fn post_submit(&self, _request: &PluginRequest, kind: ContentKind, id: u64) -> Result<(), PluginError> {
        if self.config.banned_terms.is_empty() {
            return Ok(());
        }
        let Some(body) = self.stored_body(kind, id).await? else {
            warn!(%kind, id, "submitted record vanished before moderation");
            return Ok(());
        };
        let Some(term) = self.first_match(&body) else {
            return Ok(());
        };

        let flag = Flag { kind, id, term: term.to_string(), flagged_at: Utc::now() };
        self.store.set_as(&flag_key(id), &flag).await?;
        warn!(%kind, id, term, "submission flagged");
        Ok(())
    }
}
