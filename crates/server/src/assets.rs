//! Static entry surface: the landing document and its assets.

use std::path::Path;

use axum::Router;
use tower_http::services::{ServeDir, ServeFile};

/// `GET /` serves the landing document; every other path falls back to the
/// static directory.
pub fn router(static_dir: &Path) -> Router {
    Router::new()
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .fallback_service(ServeDir::new(static_dir))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    use super::router;

    #[tokio::test]
    async fn index_document_is_served_at_the_root() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("index.html"), "<html>landing</html>").expect("write index");
        fs::write(dir.path().join("app.js"), "console.log('hi');").expect("write asset");

        let router = router(dir.path());

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("root responds");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.expect("body");
        assert_eq!(&body[..], b"<html>landing</html>");

        let asset = router
            .clone()
            .oneshot(Request::builder().uri("/app.js").body(Body::empty()).expect("request"))
            .await
            .expect("asset responds");
        assert_eq!(asset.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_assets_return_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let router = router(dir.path());

        let response = router
            .oneshot(Request::builder().uri("/missing.css").body(Body::empty()).expect("request"))
            .await
            .expect("fallback responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
