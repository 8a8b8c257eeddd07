//! Loopback HTTP server for style documents
//!
//! The tile engine resolves styles by URL and does not reliably accept
//! `file://` URLs, so styles are served over plain HTTP on 127.0.0.1.
//! Routing and HTTP framing are handled by axum.
//!
//! # Examples
//!
//! ```rust,no_run
//! use offline_regions::app::server::LocalStyleServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = LocalStyleServer::start(0).await?;
//! server.set_style("kartverket", r#"{"version":8,"sources":{},"layers":[]}"#).await?;
//! println!("{}", server.style_url("kartverket")?);
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::app::style::StyleDocumentBuilder;
use crate::constants::server as consts;
use crate::errors::{ServerError, ServerResult};

type StyleMap = Arc<RwLock<HashMap<String, Arc<str>>>>;

/// Loopback style server
///
/// Binding is explicit: a second server on the same fixed port fails with
/// [`ServerError::Bind`]. Port 0 binds an ephemeral port.
pub struct LocalStyleServer {
    addr: SocketAddr,
    styles: StyleMap,
    shutdown_tx: broadcast::Sender<()>,
    serve_task: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl LocalStyleServer {
    /// Bind the listener and start accepting connections
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Bind` if the port is already in use.
    pub async fn start(port: u16) -> ServerResult<Self> {
        let listener = TcpListener::bind((consts::LOOPBACK_HOST, port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let addr = listener.local_addr()?;

        let styles: StyleMap = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let app = router(styles.clone());
        let serve_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                    debug!("Style server received shutdown signal");
                })
                .await
        });

        info!("Style server listening on http://{}", addr);

        Ok(Self {
            addr,
            styles,
            shutdown_tx,
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Store or overwrite the document served under `name`
    ///
    /// # Errors
    ///
    /// Returns `ServerError::BadRequest` if `name` is not URL-path safe.
    pub async fn set_style(&self, name: &str, json: impl Into<String>) -> ServerResult<()> {
        validate_style_name(name)?;
        let json: String = json.into();
        debug!("Registered style '{}' ({} bytes)", name, json.len());
        self.styles.write().await.insert(name.to_string(), Arc::from(json));
        Ok(())
    }

    /// Whether a document is stored under `name`
    pub async fn has_style(&self, name: &str) -> bool {
        self.styles.read().await.contains_key(name)
    }

    /// URL at which the document for `name` is served
    pub fn style_url(&self, name: &str) -> ServerResult<Url> {
        validate_style_name(name)?;
        let url = Url::parse(&format!(
            "http://{}:{}{}{}{}",
            consts::LOOPBACK_HOST,
            self.port(),
            consts::STYLE_PATH_PREFIX,
            name,
            consts::STYLE_PATH_SUFFIX
        ))?;
        Ok(url)
    }

    /// Stop accepting connections and wait for open ones to drain
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(mut task) = self.serve_task.lock().await.take() {
            match tokio::time::timeout(consts::SHUTDOWN_TIMEOUT, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("Style server failed: {}", e),
                Ok(Err(e)) => warn!("Style server task ended abnormally: {}", e),
                Err(_) => {
                    warn!("Style server connections did not drain, aborting");
                    task.abort();
                }
            }
        }
        info!("Style server on {} stopped", self.addr);
    }
}

impl Drop for LocalStyleServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn validate_style_name(name: &str) -> ServerResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ServerError::BadRequest {
            reason: format!("style name '{}' is not URL-path safe", name),
        })
    }
}

fn router(styles: StyleMap) -> Router {
    Router::new()
        .route(&format!("{}{{file}}", consts::STYLE_PATH_PREFIX), get(serve_style))
        .with_state(styles)
}

/// Extract the style name from `{name}-style.json`
fn style_name_from_file(file: &str) -> Option<&str> {
    file.strip_suffix(consts::STYLE_PATH_SUFFIX)
        .filter(|name| !name.is_empty())
}

async fn serve_style(Path(file): Path<String>, State(styles): State<StyleMap>) -> Response {
    let Some(name) = style_name_from_file(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let stored = styles.read().await.get(name).cloned();
    let body = match stored {
        Some(doc) => doc.to_string(),
        None => {
            debug!("Unknown style '{}', serving empty style", name);
            StyleDocumentBuilder::empty_style()
                .to_json()
                .unwrap_or_else(|_| r#"{"version":8,"sources":{},"layers":[]}"#.to_string())
        }
    };

    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}
