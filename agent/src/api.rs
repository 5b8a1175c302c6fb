//! # Internal Control-Plane Router (§4.8 "Control-plane bridging")
//!
//! A tiny in-process HTTP-shaped router the tunnel client dispatches
//! `api_request` messages into. Unknown paths return `404`; handler errors
//! return `500`; everything else returns whatever status the handler picked.
//! There is no real HTTP server here — [`frame_protocol::ApiMethod`]/`path`
//! are matched directly, the same "match on method+path, build a JSON body"
//! shape as `acton-service`'s route handlers, minus the framework.

use std::sync::Arc;

use frame_protocol::ApiMethod;
use serde_json::json;

use crate::supervisor::FrameSupervisor;

pub struct ApiRouter {
    supervisor: Arc<FrameSupervisor>,
}

pub struct ApiResponse {
    pub status: u16,
    pub body: Option<serde_json::Value>,
}

impl ApiRouter {
    pub fn new(supervisor: Arc<FrameSupervisor>) -> Self {
        Self { supervisor }
    }

    pub async fn dispatch(&self, method: ApiMethod, path: &str) -> ApiResponse {
        match (method, path_segments(path).as_slice()) {
            (ApiMethod::Get, ["frames"]) => self.list_frames().await,
            (ApiMethod::Get, ["frames", id]) => self.get_frame(id).await,
            _ => ApiResponse { status: 404, body: Some(json!({ "error": "not found" })) },
        }
    }

    async fn list_frames(&self) -> ApiResponse {
        match self.supervisor.list_frames(None).await {
            Ok(frames) => ApiResponse { status: 200, body: Some(json!({ "frames": frames })) },
            Err(e) => internal_error(e),
        }
    }

    async fn get_frame(&self, id: &str) -> ApiResponse {
        match self.supervisor.get_frame(id).await {
            Ok(Some(frame)) => ApiResponse { status: 200, body: Some(json!(frame)) },
            Ok(None) => ApiResponse { status: 404, body: Some(json!({ "error": "no such frame" })) },
            Err(e) => internal_error(e),
        }
    }
}

fn internal_error(e: crate::error::AgentError) -> ApiResponse {
    ApiResponse { status: 500, body: Some(json!({ "error": e.to_string() })) }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FakeContainerAdapter;
    use crate::store::FrameStore;
    use crate::template::TemplateEngine;
    use std::collections::HashMap;
    use std::path::Path;

    async fn test_router() -> (ApiRouter, tempfile::TempDir) {
        let store = Arc::new(FrameStore::connect("sqlite::memory:").await.unwrap());
        let container = Arc::new(FakeContainerAdapter::default());
        let templates = Arc::new(TemplateEngine::load(Path::new("/nonexistent"), Path::new("/nonexistent")));
        let frames_dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(FrameSupervisor::new(
            store,
            container,
            templates,
            frames_dir.path().to_path_buf(),
            HashMap::new(),
        ));
        (ApiRouter::new(supervisor), frames_dir)
    }

    #[tokio::test]
    async fn list_frames_returns_empty_array_initially() {
        let (router, _dir) = test_router().await;
        let resp = router.dispatch(ApiMethod::Get, "/frames").await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.unwrap()["frames"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn get_unknown_frame_is_404() {
        let (router, _dir) = test_router().await;
        let resp = router.dispatch(ApiMethod::Get, "/frames/does-not-exist").await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (router, _dir) = test_router().await;
        let resp = router.dispatch(ApiMethod::Post, "/not/a/route").await;
        assert_eq!(resp.status, 404);
    }
}
