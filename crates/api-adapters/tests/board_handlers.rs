use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use api_adapters::web::{router, AppState};
use api_adapters::Metrics;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use domains::{ContentKind, KvStore};
use serde_json::{json, Value};
use services::plugins::{
    Middleware, PluginDescriptor, PluginFactory, PluginInstance, PluginRequest, PluginResponse, PluginRouter,
};
use services::{ContentStore, PluginError, PluginHost, PluginRegistry, SharedContext, StoreSettings};
use storage_adapters::MemoryStore;
use tower::ServiceExt;

const FORM: &str = "application/x-www-form-urlencoded";

/// Requires `token=ok` on thread creation and counts post-submit calls.
struct Gate {
    submitted: Arc<AtomicUsize>,
}

struct GateInstance {
    submitted: Arc<AtomicUsize>,
}

struct RequireToken;

#[async_trait]
impl Middleware for RequireToken {
    async fn handle(&self, request: &mut PluginRequest) -> Result<(), PluginError> {
        match request.fields.remove("token").as_deref() {
            Some("ok") => Ok(()),
            _ => Err(PluginError::Rejected("missing token".into())),
        }
    }
}

#[async_trait]
impl PluginFactory for Gate {
    fn name(&self) -> &'static str {
        "gate"
    }

    async fn init(
        &self,
        _descriptor: &PluginDescriptor,
        _context: &mut SharedContext,
        _store: Arc<dyn KvStore>,
    ) -> Result<Arc<dyn PluginInstance>, PluginError> {
        Ok(Arc::new(GateInstance { submitted: self.submitted.clone() }))
    }
}

#[async_trait]
impl PluginInstance for GateInstance {
    fn routes(&self, router: &mut PluginRouter) {
        router.get("/gate/{name}", |req: PluginRequest| async move {
            let name = req.param("name").unwrap_or_default().to_string();
            Ok::<_, PluginError>(PluginResponse::Json(json!({ "hello": name })))
        });
    }

    fn middleware(&self, function: &str) -> Option<Arc<dyn Middleware>> {
        (function == "requireToken").then(|| Arc::new(RequireToken) as Arc<dyn Middleware>)
    }

    fn template_fragment(&self, function: &str, _method: services::plugins::HttpMethod, _route: &str) -> Option<String> {
        (function == "gateScript").then(|| "<script src=\"/gate.js\"></script>".to_string())
    }

    async fn post_submit(&self, _request: &PluginRequest, _kind: ContentKind, _id: u64) -> Result<(), PluginError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    app: Router,
    store: Arc<ContentStore>,
    submitted: Arc<AtomicUsize>,
}

async fn harness(with_gate: bool, prefix: &str) -> Harness {
    let backend: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let store = Arc::new(ContentStore::new(backend.clone(), StoreSettings::default()));
    store.init_system().await.unwrap();

    let submitted = Arc::new(AtomicUsize::new(0));
    let mut host = PluginHost::new(PluginRegistry::new().with(Gate { submitted: submitted.clone() }));
    if with_gate {
        let descriptor = serde_json::to_vec(&json!({
            "name": "gate",
            "version": "1",
            "provides": ["routes", "middleware", "templateInjection", "postSubmitAction"],
            "middleware": [{ "method": "post", "route": "/{board}/new", "function": "requireToken", "explicit": true }],
            "templateInjection": [{ "method": "get", "route": "*", "function": "gateScript" }],
        }))
        .unwrap();
        host.register_descriptor(PluginDescriptor::from_json(&descriptor, "test").unwrap()).unwrap();
    }
    let mut context = SharedContext::new(store.boards().to_vec(), Vec::new());
    host.load(&mut context, backend).await.unwrap();

    let state = AppState::new(store.clone(), Arc::new(host), Arc::new(Metrics::new())).with_route_prefix(prefix);
    Harness { app: router(state), store, submitted }
}

async fn send(app: &Router, method: &str, uri: &str, form: &str) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, FORM)
        .body(Body::from(form.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

async fn text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn json_body(response: Response) -> Value {
    serde_json::from_str(&text(response).await).unwrap()
}

fn location(response: &Response) -> &str {
    response.headers()[header::LOCATION].to_str().unwrap()
}

#[tokio::test]
async fn test_submit_and_read_back() {
    let h = harness(false, "").await;

    let resp = send(&h.app, "POST", "/b/new", "subject=Hello&email=&content=first+post&trip=").await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/b/1/");

    let resp = send(&h.app, "POST", "/b/1/reply", "subject=&email=&content=a+reply&trip=").await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/b/1/#2");

    let detail = json_body(send(&h.app, "GET", "/b/1/source.json", "").await).await;
    assert_eq!(detail["op"]["subject"], "Hello");
    assert_eq!(detail["replies"][0]["body"], "a reply");

    let board = json_body(send(&h.app, "GET", "/b/source.json", "").await).await;
    assert_eq!(board.as_array().unwrap().len(), 1);

    let recent = json_body(send(&h.app, "GET", "/source.json", "").await).await;
    let ids: Vec<u64> = recent["posts"].as_array().unwrap().iter().map(|p| p["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![2, 1]);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let h = harness(false, "").await;

    let resp = send(&h.app, "POST", "/b/new", "subject=&email=&content=+++&trip=").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(text(resp).await.contains("Empty Content"));

    let resp = send(&h.app, "POST", "/b/new", "subject=&email=&content=x&trip=&extra=1").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send(&h.app, "POST", "/b/new", "subject=&email=not-an-email&content=x&trip=").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert_eq!(h.store.statistics().threads, 0);
    let metrics = text(send(&h.app, "GET", "/metrics", "").await).await;
    assert!(metrics.contains("threadboard_submissions_rejected_total 3"));
}

#[tokio::test]
async fn test_unknown_targets_are_not_found() {
    let h = harness(false, "").await;
    send(&h.app, "POST", "/b/new", "subject=&email=&content=x&trip=").await;

    assert_eq!(send(&h.app, "GET", "/zz/source.json", "").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(send(&h.app, "POST", "/zz/new", "").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(send(&h.app, "GET", "/b/99/source.json", "").await.status(), StatusCode::NOT_FOUND);
    // Thread 1 lives on /b/, not /cyb/.
    assert_eq!(send(&h.app, "GET", "/cyb/1/", "").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(send(&h.app, "GET", "/b/abc/", "").await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_moderation_requires_signature() {
    let h = harness(false, "").await;
    send(&h.app, "POST", "/b/new", "subject=&email=&content=op&trip=Admin+%23%23pw").await;
    send(&h.app, "POST", "/b/1/reply", "subject=&email=&content=spam&trip=").await;
    let tag = h.store.thread(1).unwrap().signature_tag.unwrap();
    h.store.set_moderators([tag]);

    let resp = send(&h.app, "POST", "/b/1/pin", "tripcode=Admin+%23%23wrong").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = send(&h.app, "POST", "/b/1/pin", "tripcode=Admin+%23%23pw").await;
    assert_eq!(location(&resp), "/b/1/?pinned=1");
    assert!(h.store.thread(1).unwrap().pinned);

    let resp = send(&h.app, "POST", "/b/1/2/delete", "tripcode=Admin+%23%23pw").await;
    assert_eq!(location(&resp), "/b/1/");
    assert!(h.store.post(2).is_none());

    let resp = send(&h.app, "POST", "/b/1/delete", "tripcode=Admin+%23%23pw").await;
    assert_eq!(location(&resp), "/b/");
    assert!(h.store.thread(1).is_none());
}

#[tokio::test]
async fn test_plugin_middleware_routes_and_fragments() {
    let h = harness(true, "").await;

    let resp = send(&h.app, "POST", "/b/new", "subject=&email=&content=x&trip=").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.submitted.load(Ordering::SeqCst), 0);

    let resp = send(&h.app, "POST", "/b/new", "subject=&email=&content=x&trip=&token=ok").await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(h.submitted.load(Ordering::SeqCst), 1);

    // Replies are not gated.
    let resp = send(&h.app, "POST", "/b/1/reply", "subject=&email=&content=y&trip=").await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(h.submitted.load(Ordering::SeqCst), 2);

    let hello = json_body(send(&h.app, "GET", "/gate/world", "").await).await;
    assert_eq!(hello, json!({ "hello": "world" }));

    let page = text(send(&h.app, "GET", "/b/", "").await).await;
    assert!(page.contains("<script src=\"/gate.js\"></script>"));
    assert!(page.contains("data-source=\"/b/source.json\""));
}

#[tokio::test]
async fn test_route_prefix_applies_to_redirects() {
    let h = harness(false, "/board").await;

    let resp = send(&h.app, "POST", "/board/b/new", "subject=&email=&content=x&trip=").await;
    assert_eq!(location(&resp), "/board/b/1/");
    assert_eq!(send(&h.app, "GET", "/b/1/source.json", "").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(send(&h.app, "GET", "/board/b/1/source.json", "").await.status(), StatusCode::OK);
}
