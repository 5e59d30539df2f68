use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::map_response_with_state;
use axum::response::{IntoResponse, Response};
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

use crate::error::ServeError;

/// Largest page buffered for reload injection.
const MAX_HTML: usize = 16 * 1024 * 1024;

/// Serves `root` on `address` from a dedicated thread running a single
/// threaded tokio runtime. HTML responses get `script` injected.
pub fn start(
    address: SocketAddr,
    root: Utf8PathBuf,
    script: String,
) -> Result<thread::JoinHandle<Result<(), ServeError>>, ServeError> {
    let listener = std::net::TcpListener::bind(address).map_err(|e| ServeError::Bind(address, e))?;
    listener.set_nonblocking(true)?;

    let url = format!("http://localhost:{}/", listener.local_addr()?.port());
    info!(url = %style(url).yellow(), "starting a HTTP server");

    Ok(thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServeError::Runtime)?
            .block_on(serve(listener, root, script))
    }))
}

async fn serve(
    listener: std::net::TcpListener,
    root: Utf8PathBuf,
    script: String,
) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    axum::serve(listener, router(root, script)).await?;
    Ok(())
}

fn router(root: Utf8PathBuf, script: String) -> Router {
    Router::new()
        // path to the output directory
        .fallback_service(ServeDir::new(root))
        .layer(map_response_with_state(Arc::<str>::from(script), inject_reload))
}

async fn inject_reload(State(script): State<Arc<str>>, response: Response) -> Response {
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/html"));

    if !is_html {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_HTML).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("couldn't buffer page for reload injection: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let html = inject_script(&bytes, &script);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(html.len()));

    Response::from_parts(parts, Body::from(html))
}

/// Inserts `script` before the closing body tag, or appends it when the
/// page has none.
pub fn inject_script(html: &[u8], script: &str) -> Vec<u8> {
    const CLOSE: &[u8] = b"</body>";

    let at = html
        .windows(CLOSE.len())
        .rposition(|window| window.eq_ignore_ascii_case(CLOSE))
        .unwrap_or(html.len());

    let mut out = Vec::with_capacity(html.len() + script.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(script.as_bytes());
    out.extend_from_slice(&html[at..]);
    out
}
