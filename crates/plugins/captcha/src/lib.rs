//! Text-challenge captcha.
//!
//! `GET /captcha/new` stores a challenge and redirects to its page; solving
//! it through `POST /captcha/{id}/solve` hands out a one-time key (OTK).
//! The `useOTK` middleware consumes that key from the `otk` form field of
//! guarded submissions and strips the field before the submission is
//! sanitized.
//!
//! Challenges and keys both expire after `ttlSeconds`. Stale challenge
//! records are swept from the store when new challenges are created, at
//! most once per ttl.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use domains::{KvStore, KvStoreExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use services::plugins::{
    ContextDelta, HttpMethod, Middleware, PluginDescriptor, PluginFactory, PluginInstance, PluginRequest,
    PluginResponse, PluginRouter, SharedContext,
};
use services::PluginError;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PLUGIN_NAME: &str = "captcha";
pub const RECORD_PREFIX: &str = "captcha-";
pub const OTK_FIELD: &str = "otk";
pub const SOLUTION_FIELD: &str = "solution";

const NOT_SOLVED: &str = "You have not solved a captcha yet. Please try again.";
const WRONG_SOLUTION: &str = "Invalid Solution. Try again!";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptchaConfig {
    pub enabled: bool,
    /// Characters per challenge, at most 32.
    pub length: usize,
    pub ttl_seconds: i64,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self { enabled: true, length: 6, ttl_seconds: 600 }
    }
}

/// A stored challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

fn record_key(id: &str) -> String {
    format!("{RECORD_PREFIX}{id}")
}

/// Challenge ids are simple-form uuids; anything else is never a key.
fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

struct Captcha {
    config: CaptchaConfig,
    route_prefix: String,
    store: Arc<dyn KvStore>,
    /// Issued keys and when they were issued.
    otks: DashMap<String, DateTime<Utc>>,
    /// Unix seconds of the last challenge sweep.
    last_sweep: AtomicI64,
}

impl Captcha {
    fn new(config: CaptchaConfig, route_prefix: String, store: Arc<dyn KvStore>) -> Self {
        Self { config, route_prefix, store, otks: DashMap::new(), last_sweep: AtomicI64::new(0) }
    }

    fn expired(&self, issued: DateTime<Utc>) -> bool {
        Utc::now() - issued > Duration::seconds(self.config.ttl_seconds)
    }

    /// Removes every stored challenge older than the ttl. Returns how many
    /// records were removed.
    async fn sweep_expired(&self) -> Result<usize, PluginError> {
        let mut removed = 0;
        for key in self.store.list_keys().await? {
            if !key.starts_with(RECORD_PREFIX) {
                continue;
            }
            match self.store.get_as::<Challenge>(&key).await {
                Ok(Some(challenge)) if self.expired(challenge.timestamp) => {
                    self.store.remove(&key).await?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(key, error = %e, "unreadable captcha record"),
            }
        }
        if removed > 0 {
            debug!(removed, "expired captchas swept");
        }
        Ok(removed)
    }

    /// Sweeps unless another sweep ran within the last ttl.
    async fn sweep_if_due(&self) {
        let now = Utc::now().timestamp();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now - last < self.config.ttl_seconds {
            return;
        }
        if self.last_sweep.compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed).is_err() {
            return;
        }
        if let Err(e) = self.sweep_expired().await {
            warn!(error = %e, "captcha sweep failed");
        }
    }

    fn issue_otk(&self) -> String {
        let now = Utc::now();
        self.otks.retain(|_, issued| !self.expired(*issued));
        let otk = format!("{}{}", now.timestamp_millis(), Uuid::new_v4().simple());
        self.otks.insert(otk.clone(), now);
        otk
    }

    /// Consumes `otk`. Expired keys are consumed too but never accepted.
    fn redeem_otk(&self, otk: &str) -> bool {
        self.otks.remove(otk).is_some_and(|(_, issued)| !self.expired(issued))
    }

    async fn create(&self) -> Result<String, PluginError> {
        self.sweep_if_due().await;
        let id = Uuid::new_v4().simple().to_string();
        let text: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(self.config.length.clamp(1, 32))
            .collect();
        let challenge = Challenge { text, timestamp: Utc::now() };
        self.store.set_as(&record_key(&id), &challenge).await?;
        debug!(id, "captcha created");
        Ok(id)
    }

    async fn load(&self, id: &str) -> Result<Challenge, PluginError> {
        let missing = || PluginError::Rejected(format!("No Such Captcha {id}"));
        if !valid_id(id) {
            return Err(missing());
        }
        self.store.get_as::<Challenge>(&record_key(id)).await?.ok_or_else(missing)
    }

    fn page(&self, id: &str, challenge: &Challenge) -> String {
        let glyphs: String = challenge
            .text
            .chars()
            .map(|c| format!("<span>{}</span>", html_escape::encode_text(&c.to_string())))
            .collect();
        format!(
            concat!(
                "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>captcha</title></head><body>",
                "<p class=\"challenge\">{glyphs}</p>",
                "<form method=\"post\" action=\"{action}\">",
                "<input name=\"{field}\" autocomplete=\"off\"><button>solve</button>",
                "</form></body></html>"
            ),
            glyphs = glyphs,
            action = html_escape::encode_double_quoted_attribute(&format!("{}/captcha/{id}/solve", self.route_prefix)),
            field = SOLUTION_FIELD,
        )
    }

    async fn solve(&self, id: &str, solution: &str) -> Result<Value, PluginError> {
        let challenge = self.load(id).await?;
        if self.expired(challenge.timestamp) {
            self.store.remove(&record_key(id)).await?;
            return Ok(json!({ "status": "fail", "error": "Captcha expired. Request a new one." }));
        }
        if challenge.text != solution {
            return Ok(json!({ "status": "fail", "error": WRONG_SOLUTION }));
        }

        let otk = self.issue_otk();
        self.store.remove(&record_key(id)).await?;
        info!(id, "captcha solved");
        Ok(json!({ "status": "OK", "otk": otk }))
    }
}

/// The `useOTK` middleware.
struct UseOtk(Arc<Captcha>);

#[async_trait]
impl Middleware for UseOtk {
    async fn handle(&self, request: &mut PluginRequest) -> Result<(), PluginError> {
        let otk = request.fields.remove(OTK_FIELD);
        if !self.0.config.enabled {
            return Ok(());
        }
        match otk {
            Some(otk) if self.0.redeem_otk(&otk) => Ok(()),
            _ => Err(PluginError::Rejected(NOT_SOLVED.into())),
        }
    }
}

#[derive(Default)]
pub struct CaptchaFactory;

#[async_trait]
impl PluginFactory for CaptchaFactory {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn init(
        &self,
        descriptor: &PluginDescriptor,
        context: &mut SharedContext,
        store: Arc<dyn KvStore>,
    ) -> Result<Arc<dyn PluginInstance>, PluginError> {
        let config: CaptchaConfig = match &descriptor.config {
            Value::Null => CaptchaConfig::default(),
            value => serde_json::from_value(value.clone()).map_err(|e| PluginError::Init {
                plugin: descriptor.id().to_string(),
                reason: e.to_string(),
            })?,
        };
        let route_prefix = context.route_prefix().to_string();
        info!(enabled = config.enabled, length = config.length, "captcha plugin ready");

        Ok(Arc::new(CaptchaPlugin(Arc::new(Captcha::new(config, route_prefix, store)))))
    }
}

struct CaptchaPlugin(Arc<Captcha>);

#[async_trait]
impl PluginInstance for CaptchaPlugin {
    fn routes(&self, router: &mut PluginRouter) {
        let captcha = self.0.clone();
        router.get("/captcha/new", move |_req: PluginRequest| {
            let captcha = captcha.clone();
            async move {
                let id = captcha.create().await?;
                Ok::<_, PluginError>(PluginResponse::Redirect(format!("/captcha/{id}")))
            }
        });

        let captcha = self.0.clone();
        router.get("/captcha/{id}", move |req: PluginRequest| {
            let captcha = captcha.clone();
            async move {
                let id = req.param("id").unwrap_or_default();
                let challenge = captcha.load(id).await?;
                Ok::<_, PluginError>(PluginResponse::Html(captcha.page(id, &challenge)))
            }
        });

        let captcha = self.0.clone();
        router.post("/captcha/{id}/solve", move |req: PluginRequest| {
            let captcha = captcha.clone();
            async move {
                let solution = req
                    .field(SOLUTION_FIELD)
                    .ok_or_else(|| PluginError::Rejected(format!("Missing key: {SOLUTION_FIELD}")))?;
                let outcome = captcha.solve(req.param("id").unwrap_or_default(), solution).await?;
                Ok::<_, PluginError>(PluginResponse::Json(outcome))
            }
        });
    }

    fn middleware(&self, function: &str) -> Option<Arc<dyn Middleware>> {
        (function == "useOTK").then(|| Arc::new(UseOtk(self.0.clone())) as Arc<dyn Middleware>)
    }

    fn template_fragment(&self, function: &str, _method: HttpMethod, _route: &str) -> Option<String> {
        (function == "captchaResourceLink").then(|| {
            let href = format!("{}/captcha/new", self.0.route_prefix);
            format!(
                "<link rel=\"captcha\" href=\"{}\">",
                html_escape::encode_double_quoted_attribute(&href)
            )
        })
    }

    fn context(&self, _context: &SharedContext) -> ContextDelta {
        ContextDelta::default().with_value(
            PLUGIN_NAME,
            json!({ "enabled": self.0.config.enabled, "prefix": RECORD_PREFIX }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_adapters::MemoryStore;

    async fn plugin(config: Value) -> (Arc<dyn PluginInstance>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let descriptor: PluginDescriptor = serde_json::from_value(json!({
            "name": "captcha",
            "version": "1",
            "config": config,
        }))
        .unwrap();
        let mut context = SharedContext::default().with_route_prefix("/board");
        let instance = CaptchaFactory.init(&descriptor, &mut context, store.clone()).await.unwrap();
        (instance, store)
    }

    fn route(instance: &Arc<dyn PluginInstance>, method: HttpMethod, path: &str) -> services::plugins::PluginRoute {
        let mut router = PluginRouter::new();
        instance.routes(&mut router);
        router
            .into_routes()
            .into_iter()
            .find(|r| r.method == method && r.path == path)
            .unwrap()
    }

    fn request(route: &str, id: &str) -> PluginRequest {
        PluginRequest::new(HttpMethod::Post, route, format!("/captcha/{id}/solve"))
            .with_params([("id".to_string(), id.to_string())].into())
    }

    async fn new_challenge(instance: &Arc<dyn PluginInstance>) -> String {
        let new = route(instance, HttpMethod::Get, "/captcha/new");
        match new.handler.call(PluginRequest::new(HttpMethod::Get, "/captcha/new", "/captcha/new")).await.unwrap() {
            PluginResponse::Redirect(to) => to.trim_start_matches("/captcha/").to_string(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn solving_issues_a_single_use_key() {
        let (instance, store) = plugin(Value::Null).await;
        let id = new_challenge(&instance).await;
        let challenge: Challenge = store.get_as(&record_key(&id)).await.unwrap().unwrap();
        assert_eq!(challenge.text.len(), 6);

        let solve = route(&instance, HttpMethod::Post, "/captcha/{id}/solve");
        let wrong = request("/captcha/{id}/solve", &id).with_fields([(SOLUTION_FIELD.to_string(), "nope".to_string())].into());
        match solve.handler.call(wrong).await.unwrap() {
            PluginResponse::Json(v) => assert_eq!(v["status"], "fail"),
            other => panic!("unexpected {other:?}"),
        }

        let right = request("/captcha/{id}/solve", &id).with_fields([(SOLUTION_FIELD.to_string(), challenge.text)].into());
        let otk = match solve.handler.call(right).await.unwrap() {
            PluginResponse::Json(v) => {
                assert_eq!(v["status"], "OK");
                v["otk"].as_str().unwrap().to_string()
            }
            other => panic!("unexpected {other:?}"),
        };
        assert!(store.get(&record_key(&id)).await.unwrap().is_none());

        let guard = instance.middleware("useOTK").unwrap();
        let submission = |otk: &str| {
            PluginRequest::new(HttpMethod::Post, "/{board}/new", "/b/new")
                .with_fields([(OTK_FIELD.to_string(), otk.to_string()), ("content".to_string(), "x".to_string())].into())
        };
        let mut first = submission(&otk);
        guard.handle(&mut first).await.unwrap();
        assert!(first.field(OTK_FIELD).is_none());
        assert_eq!(first.field("content"), Some("x"));

        let mut replay = submission(&otk);
        assert!(matches!(guard.handle(&mut replay).await, Err(PluginError::Rejected(_))));
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_rejected() {
        let (instance, _) = plugin(Value::Null).await;
        let show = route(&instance, HttpMethod::Get, "/captcha/{id}");
        for id in ["abc123", "../SYS"] {
            let req = PluginRequest::new(HttpMethod::Get, "/captcha/{id}", "/captcha/x")
                .with_params([("id".to_string(), id.to_string())].into());
            assert!(matches!(show.handler.call(req).await, Err(PluginError::Rejected(_))));
        }

        let solve = route(&instance, HttpMethod::Post, "/captcha/{id}/solve");
        let id = new_challenge(&instance).await;
        assert!(matches!(
            solve.handler.call(request("/captcha/{id}/solve", &id)).await,
            Err(PluginError::Rejected(msg)) if msg == "Missing key: solution"
        ));
    }

    #[tokio::test]
    async fn disabled_captcha_only_strips_the_field() {
        let (instance, _) = plugin(json!({ "enabled": false })).await;
        let guard = instance.middleware("useOTK").unwrap();
        let mut req = PluginRequest::new(HttpMethod::Post, "/{board}/new", "/b/new")
            .with_fields([(OTK_FIELD.to_string(), "whatever".to_string())].into());
        guard.handle(&mut req).await.unwrap();
        assert!(req.fields.is_empty());
    }

    #[tokio::test]
    async fn fragment_and_page_use_the_route_prefix() {
        let (instance, _) = plugin(Value::Null).await;
        assert_eq!(
            instance.template_fragment("captchaResourceLink", HttpMethod::Get, "/").unwrap(),
            "<link rel=\"captcha\" href=\"/board/captcha/new\">"
        );
        assert!(instance.template_fragment("other", HttpMethod::Get, "/").is_none());

        let id = new_challenge(&instance).await;
        let show = route(&instance, HttpMethod::Get, "/captcha/{id}");
        let req = PluginRequest::new(HttpMethod::Get, "/captcha/{id}", "/captcha/x")
            .with_params([("id".to_string(), id.clone())].into());
        match show.handler.call(req).await.unwrap() {
            PluginResponse::Html(page) => assert!(page.contains(&format!("action=\"/board/captcha/{id}/solve\""))),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn stale(seconds: i64) -> DateTime<Utc> {
        Utc::now() - Duration::seconds(seconds)
    }

    #[tokio::test]
    async fn expired_challenges_are_swept_on_create() {
        let (instance, store) = plugin(json!({ "ttlSeconds": 60 })).await;
        let old = Challenge { text: "abc".into(), timestamp: stale(120) };
        let young = Challenge { text: "def".into(), timestamp: stale(5) };
        store.set_as(&record_key("0ld"), &old).await.unwrap();
        store.set_as(&record_key("beef"), &young).await.unwrap();
        store.set("thread-1", json!({})).await.unwrap();

        let id = new_challenge(&instance).await;

        assert!(store.get(&record_key("0ld")).await.unwrap().is_none());
        assert!(store.get(&record_key("beef")).await.unwrap().is_some());
        assert!(store.get(&record_key(&id)).await.unwrap().is_some());
        assert!(store.get("thread-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweeps_run_at_most_once_per_ttl() {
        let store = Arc::new(MemoryStore::new());
        let captcha = Captcha::new(CaptchaConfig::default(), String::new(), store.clone());
        captcha.create().await.unwrap();

        let old = Challenge { text: "abc".into(), timestamp: stale(3600) };
        store.set_as(&record_key("ab"), &old).await.unwrap();
        captcha.create().await.unwrap();
        assert!(store.get(&record_key("ab")).await.unwrap().is_some());

        assert_eq!(captcha.sweep_expired().await.unwrap(), 1);
        assert!(store.get(&record_key("ab")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_keys_are_refused_and_forgotten() {
        let config = CaptchaConfig { ttl_seconds: 60, ..CaptchaConfig::default() };
        let captcha = Arc::new(Captcha::new(config, String::new(), Arc::new(MemoryStore::new())));
        captcha.otks.insert("old-key".into(), stale(120));
        captcha.otks.insert("lingering".into(), stale(90));
        let fresh = captcha.issue_otk();
        assert!(!captcha.otks.contains_key("lingering"));

        let guard = UseOtk(captcha.clone());
        let with_otk = |otk: &str| {
            PluginRequest::new(HttpMethod::Post, "/{board}/new", "/b/new")
                .with_fields([(OTK_FIELD.to_string(), otk.to_string())].into())
        };
        // "old-key" was dropped by the retain in `issue_otk` as well.
        assert!(matches!(guard.handle(&mut with_otk("old-key")).await, Err(PluginError::Rejected(_))));
        guard.handle(&mut with_otk(&fresh)).await.unwrap();
        assert!(captcha.otks.is_empty());

        captcha.otks.insert("raced".into(), stale(120));
        assert!(!captcha.redeem_otk("raced"));
        assert!(!captcha.otks.contains_key("raced"));
    }
}
