//! Static file tree handler.
//!
//! Serves a read-only directory tree for a hostname. Path containment is
//! checked explicitly rather than delegated to a file-serving utility: the
//! request path must consist of plain components (no `..`, no absolute
//! segments), and the resolved file is canonicalized and bound-checked
//! against the canonicalized root before it is opened. Directories resolve
//! to their `index.html`; index-less directories answer 403.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::CACHE_CONTROL_STATIC;

/// Read-only view onto a directory, rooted at a canonicalized path.
#[derive(Clone)]
pub struct StaticTree {
    root: Arc<PathBuf>,
}

impl StaticTree {
    /// Canonicalizes the root eagerly; a missing root is a startup error,
    /// not something to discover per request.
    pub fn new<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        let root = std::fs::canonicalize(root)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// Wrap the tree as a host handler.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(any(serve))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::CACHE_CONTROL,
                HeaderValue::from_static(CACHE_CONTROL_STATIC),
            ))
            .with_state(self)
    }
}

async fn serve(State(tree): State<StaticTree>, req: Request) -> Response {
    let head = match *req.method() {
        Method::GET => false,
        Method::HEAD => true,
        _ => {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "GET, HEAD")],
            )
                .into_response();
        }
    };

    let Some(relative) = sanitize(req.uri().path()) else {
        tracing::debug!(path = %req.uri().path(), "Rejected unsafe request path");
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    match resolve(&tree.root, &relative).await {
        Ok(file) => respond(file, head).await,
        Err(status) => (status, "not found").into_response(),
    }
}

/// Request path -> relative filesystem path, or None if any component is
/// not a plain name.
fn sanitize(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let mut clean = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => clean.push(segment),
            // Nothing else belongs in a request path.
            _ => return None,
        }
    }
    Some(clean)
}

/// Resolve to a regular file under the root, mapping misses and escapes to
/// an HTTP status.
async fn resolve(root: &Path, relative: &Path) -> Result<PathBuf, StatusCode> {
    let candidate = root.join(relative);

    let metadata = tokio::fs::metadata(&candidate)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let file = if metadata.is_dir() {
        let index = candidate.join("index.html");
        match tokio::fs::metadata(&index).await {
            Ok(m) if m.is_file() => index,
            // No directory listings; an index-less directory is forbidden.
            _ => return Err(StatusCode::FORBIDDEN),
        }
    } else {
        candidate
    };

    // Canonicalize after resolution so symlinks cannot step outside the root.
    let resolved = tokio::fs::canonicalize(&file)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    if !resolved.starts_with(root) {
        tracing::warn!(path = %resolved.display(), "Resolved path escaped the tree root");
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(resolved)
}

async fn respond(path: PathBuf, head: bool) -> Response {
    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read file");
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let length = contents.len();

    let body = if head { Body::empty() } else { Body::from(contents) };

    (
        [
            (header::CONTENT_TYPE, mime.as_ref().to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn fixture() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/style.css"), "body {}").unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "secret").unwrap();

        let router = StaticTree::new(dir.path()).unwrap().into_router();
        (dir, router)
    }

    fn get(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn serves_index_for_root() {
        let (_dir, app) = fixture();
        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"<h1>home</h1>");
    }

    #[tokio::test]
    async fn content_type_from_extension() {
        let (_dir, app) = fixture();
        let response = app.oneshot(get("/css/style.css")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let (_dir, app) = fixture();
        let response = app.oneshot(get("/nope.html")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn directory_without_index_is_403() {
        let (_dir, app) = fixture();
        let response = app.oneshot(get("/empty")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn parent_components_are_rejected() {
        let (_dir, app) = fixture();
        let response = app.oneshot(get("/../secret.txt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn head_omits_body_but_keeps_length() {
        let (_dir, app) = fixture();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/secret.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "6");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn post_is_method_not_allowed() {
        let (_dir, app) = fixture();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_refused() {
        let (dir, app) = fixture();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("target.txt"), "outside").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("target.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let response = app.oneshot(get("/link.txt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn sanitize_accepts_plain_paths_only() {
        assert_eq!(sanitize("/a/b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(sanitize("/"), Some(PathBuf::new()));
        assert_eq!(sanitize("/../x"), None);
        assert_eq!(sanitize("/a/../../x"), None);
    }
}
