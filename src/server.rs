//! Development server.
//!
//! 1. **HTTP**: `axum` serves the build directory through `tower-http`'s
//!    `ServeDir`. HTML responses get the live-reload client snippet injected
//!    right before `</body>`.
//! 2. **Live-reload**: a `tungstenite` WebSocket listener running on its own
//!    threads keeps the connected browser tabs and pushes a JSON message to all
//!    of them whenever a [`ReloadHandle`] is notified. Delivery is best effort.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use camino::Utf8PathBuf;
use serde::Serialize;
use tower_http::services::ServeDir;
use tungstenite::WebSocket;

use crate::utils::paint_num;

/// Connections kept open; older ones are closed first.
const MAX_CLIENTS: usize = 10;

/// Message pushed to live-reload clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reload {
    command: &'static str,
    pub path: String,
    /// Only stylesheets changed, clients may swap them without a full reload.
    #[serde(rename = "liveCSS")]
    pub live_css: bool,
}

impl Reload {
    pub fn page(path: impl Into<String>) -> Self {
        Self {
            command: "reload",
            path: path.into(),
            live_css: false,
        }
    }

    pub fn stylesheet(path: impl Into<String>) -> Self {
        Self {
            command: "reload",
            path: path.into(),
            live_css: true,
        }
    }
}

/// Sending side of the reload channel. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct ReloadHandle(Sender<Reload>);

impl ReloadHandle {
    /// Handle detached from any server, paired with the receiving end.
    pub fn channel() -> (Self, Receiver<Reload>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self(tx), rx)
    }

    pub fn notify(&self, reload: Reload) {
        if self.0.send(reload).is_err() {
            tracing::debug!("live-reload channel closed, dropping notification");
        }
    }
}

pub struct DevServer {
    pub port: u16,
    pub reload_port: u16,
    reload: ReloadHandle,
    _threads: (JoinHandle<()>, JoinHandle<()>),
    _http: tokio::task::JoinHandle<()>,
}

impl DevServer {
    /// Bind both listeners and start serving `build_dir`. Must be called from
    /// within a Tokio runtime.
    pub async fn start(build_dir: Utf8PathBuf, port: u16, reload_port: u16) -> std::io::Result<Self> {
        let (tcp, reload_port) = reserve_port(reload_port)?;
        let clients = Arc::new(Mutex::new(vec![]));

        let thread_i = new_thread_ws_incoming(tcp, clients.clone());
        let (tx_reload, thread_o) = new_thread_ws_reload(clients);

        let address = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(address).await?;
        let port = listener.local_addr()?.port();

        let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".into());
        tracing::info!(
            "Local webserver listening on {} ({})",
            paint_num(port),
            console::style(format!("http://{}:{port}/", host.to_lowercase())).yellow()
        );

        let router = Router::new()
            .fallback_service(ServeDir::new(build_dir))
            .layer(from_fn_with_state(reload_port, inject_reload));

        let http = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("HTTP server stopped: {e}");
            }
        });

        Ok(Self {
            port,
            reload_port,
            reload: ReloadHandle(tx_reload),
            _threads: (thread_i, thread_o),
            _http: http,
        })
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }
}

fn reserve_port(preferred: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind(("0.0.0.0", preferred)) {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("0.0.0.0:0")?,
    };

    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn new_thread_ws_incoming(
    server: TcpListener,
    clients: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("live-reload connection failed: {e}");
                    continue;
                }
            };

            match tungstenite::accept(stream) {
                Ok(socket) => clients
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(socket),
                Err(e) => tracing::warn!("live-reload handshake failed: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(
    clients: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> (Sender<Reload>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let thread = std::thread::spawn(move || broadcast(rx, clients));
    (tx, thread)
}

fn broadcast(rx: Receiver<Reload>, clients: Arc<Mutex<Vec<WebSocket<TcpStream>>>>) {
    while let Ok(reload) = rx.recv() {
        let message = match serde_json::to_string(&reload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("couldn't encode reload message: {e}");
                continue;
            }
        };

        let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
        let mut broken = vec![];

        for (i, socket) in clients.iter_mut().enumerate() {
            match socket.send(message.as_str().into()) {
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) => {
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        broken.push(i);
                    }
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    broken.push(i);
                }
                Err(e) => tracing::error!("live-reload send failed: {e:?}"),
            }
        }

        for i in broken.into_iter().rev() {
            clients.remove(i);
        }

        let len = clients.len();
        if len > MAX_CLIENTS {
            for mut socket in clients.drain(0..len - MAX_CLIENTS) {
                socket.close(None).ok();
            }
        }

        tracing::debug!(path = %reload.path, clients = clients.len(), "reload pushed");
    }
}

/// Only complete HTML bodies served to a GET get the snippet; HEAD answers
/// and partial content keep their original length.
fn should_inject(method: &Method, response: &Response) -> bool {
    *method == Method::GET
        && response.status() == StatusCode::OK
        && response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/html"))
}

async fn inject_reload(State(reload_port): State<u16>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let response = next.run(request).await;

    if !should_inject(&method, &response) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("couldn't buffer HTML response: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(inject_snippet(&bytes, reload_port)))
}

fn client_snippet(reload_port: u16) -> String {
    format!(
        r#"<script>(function () {{
  var ws = new WebSocket("ws://" + location.hostname + ":{reload_port}/");
  ws.onmessage = function (event) {{
    var msg = JSON.parse(event.data);
    if (msg.liveCSS) {{
      document.querySelectorAll('link[rel="stylesheet"]').forEach(function (link) {{
        var url = new URL(link.href);
        url.searchParams.set("livereload", Date.now());
        link.href = url.toString();
      }});
    }} else {{
      location.reload();
    }}
  }};
}})();</script>"#
    )
}

/// Insert the client snippet before the last `</body>`, or append it.
fn inject_snippet(html: &[u8], reload_port: u16) -> Vec<u8> {
    let snippet = client_snippet(reload_port);
    let lower = html.to_ascii_lowercase();
    let needle = b"</body>";

    let at = lower
        .windows(needle.len())
        .rposition(|window| window == needle)
        .unwrap_or(html.len());

    let mut out = Vec::with_capacity(html.len() + snippet.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(snippet.as_bytes());
    out.extend_from_slice(&html[at..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_goes_before_body_end() {
        let html = b"<html><BODY><p>x</p></BODY></html>";
        let out = String::from_utf8(inject_snippet(html, 35729)).unwrap();

        let script = out.find("<script>").unwrap();
        assert!(script < out.find("</BODY>").unwrap());
        assert!(out.contains(":35729/"));
        assert!(out.starts_with("<html><BODY><p>x</p>"));
    }

    #[test]
    fn test_snippet_appended_without_body() {
        let out = String::from_utf8(inject_snippet(b"<p>fragment</p>", 1)).unwrap();
        assert!(out.starts_with("<p>fragment</p><script>"));
    }

    #[test]
    fn test_only_full_html_gets_injected() {
        let html = |status: StatusCode, content_type: &str| {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type.parse().unwrap());
            response
        };

        let page = html(StatusCode::OK, "text/html; charset=utf-8");
        assert!(should_inject(&Method::GET, &page));
        assert!(!should_inject(&Method::HEAD, &page));

        let partial = html(StatusCode::PARTIAL_CONTENT, "text/html");
        assert!(!should_inject(&Method::GET, &partial));

        let css = html(StatusCode::OK, "text/css");
        assert!(!should_inject(&Method::GET, &css));
    }

    #[test]
    fn test_reload_messages() {
        let page = serde_json::to_value(Reload::page("/index.html")).unwrap();
        assert_eq!(
            page,
            serde_json::json!({"command": "reload", "path": "/index.html", "liveCSS": false})
        );

        let css = serde_json::to_value(Reload::stylesheet("/css/main.css")).unwrap();
        assert_eq!(css["liveCSS"], true);
    }

    #[test]
    fn test_notify_after_shutdown_is_harmless() {
        let (tx, rx) = std::sync::mpsc::channel();
        drop(rx);
        ReloadHandle(tx).notify(Reload::page("/"));
    }
}
