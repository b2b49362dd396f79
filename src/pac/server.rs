use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";
pub const PAC_PATH: &str = "/proxy.pac";

pub fn pac_url(port: u16) -> String {
    format!("http://127.0.0.1:{}{}", port, PAC_PATH)
}

/// Local HTTP endpoint the OS fetches the PAC script from.
pub struct PacServer {
    port: u16,
    script: Arc<RwLock<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PacServer {
    pub async fn start(port: u16, script: String) -> CoreResult<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => CoreError::PortInUse(port),
            _ => CoreError::PacServer(format!("bind {} failed: {}", addr, e)),
        })?;
        log::info!("[PAC] Serving PAC on {}", pac_url(port));

        let script = Arc::new(RwLock::new(script));
        let shared = Arc::clone(&script);
        let (shutdown, mut stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    accepted = listener.accept() => {
                        let (stream, _peer) = match accepted {
                            Ok(v) => v,
                            Err(e) => {
                                log::warn!("[PAC] Accept failed: {}", e);
                                continue;
                            }
                        };
                        let script = Arc::clone(&shared);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let script = Arc::clone(&script);
                                async move { Ok::<_, Infallible>(respond(&req, &script.read())) }
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                                log::warn!("[PAC] Connection error: {}", e);
                            }
                        });
                    }
                }
            }
            log::info!("[PAC] PAC server on port {} closed", port);
        });

        Ok(Self { port, script, shutdown: Some(shutdown), task: Some(task) })
    }

    pub fn port(&self) -> u16 { self.port }

    pub fn url(&self) -> String { pac_url(self.port) }

    /// Swaps the served script; in-flight and later requests see the new body.
    pub fn set_script(&self, script: String) {
        *self.script.write() = script;
    }

    pub async fn stop(mut self) {
        log::info!("[PAC] Closing PAC server");
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[PAC] PAC server task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PacServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn respond(req: &Request<Incoming>, script: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    if req.method() != Method::GET && req.method() != Method::HEAD {
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return response;
    }
    match req.uri().path() {
        "/" | PAC_PATH => {
            *response.body_mut() = Full::new(Bytes::from(script.to_owned()));
            response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(PAC_CONTENT_TYPE));
        }
        _ => *response.status_mut() = StatusCode::NOT_FOUND,
    }
    response
}
