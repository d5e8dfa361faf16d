//! HTTP dispatcher and gateway lifecycle.
//!
//! Routes the three lookup families onto the writer/engine pipeline:
//!
//! | Path | GET | OPTIONS | PUT |
//! |------|-----|---------|-----|
//! | `/multihash/{b58}` | cascade lookup | preflight | 404 |
//! | `/cid/{cid}` | cascade lookup | preflight | 404 |
//! | `/routing/v1/providers/{cid}` | delegated-routing lookup | preflight | 501 |
//! | `/ready` | version | 405 | 405 |
//!
//! Every handler drains the request body before responding, and the
//! per-request discovery engine is cancelled when the handler (or the
//! streamed body) finishes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, options};
use axum::Router;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::engine::DiscoveryEngine;
use crate::error::HttpError;
use crate::kad::{KadRouter, RouterMode};
use crate::peerstore::Peerstore;
use crate::response::{
    CascadeLookupWriter, DelegatedRoutingLookupWriter, LookupResponseWriter, ResponseMode,
    WriterParts,
};
use crate::routing::{ContentRouting, RoutingSelector};

const HEADER_IPNI_ALLOW_CASCADE: &str = "X-IPNI-Allow-Cascade";

pub struct Gateway<R> {
    config: GatewayConfig,
    engine: DiscoveryEngine<R>,
}

impl<R: ContentRouting> Gateway<R> {
    pub fn new(
        config: GatewayConfig,
        routing: RoutingSelector<R>,
        peerstore: Arc<Peerstore>,
        shutdown: CancellationToken,
    ) -> Self {
        let engine = DiscoveryEngine::new(&config, routing, peerstore, shutdown);
        Self { config, engine }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

/// Builds the request dispatcher over a shared gateway.
pub fn router<R: ContentRouting>(gateway: Arc<Gateway<R>>) -> Router {
    Router::new()
        .route(
            "/multihash",
            options(handle_preflight::<R>).fallback(handle_not_found),
        )
        .route(
            "/multihash/:multihash",
            get(handle_cascade_multihash::<R>)
                .options(handle_preflight::<R>)
                .fallback(handle_not_found),
        )
        .route("/cid", options(handle_preflight::<R>).fallback(handle_not_found))
        .route(
            "/cid/:cid",
            get(handle_cascade_cid::<R>)
                .options(handle_preflight::<R>)
                .fallback(handle_not_found),
        )
        .route(
            "/routing/v1/providers/:cid",
            get(handle_delegated_routing::<R>)
                .options(handle_preflight::<R>)
                .put(handle_not_implemented)
                .fallback(handle_not_found),
        )
        .route(
            "/ready",
            get(handle_ready).fallback(handle_ready_method_not_allowed),
        )
        .fallback(handle_not_found)
        .with_state(gateway)
}

async fn handle_cascade_multihash<R: ContentRouting>(
    State(gateway): State<Arc<Gateway<R>>>,
    Path(segment): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    discard_body(body).await;
    let accepted =
        CascadeLookupWriter::accept_multihash(&segment, &parts.headers, gateway.config(), true);
    complete_lookup(gateway, &parts, accepted).await
}

async fn handle_cascade_cid<R: ContentRouting>(
    State(gateway): State<Arc<Gateway<R>>>,
    Path(segment): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    discard_body(body).await;
    let accepted = CascadeLookupWriter::accept_cid(&segment, &parts.headers, gateway.config(), true);
    complete_lookup(gateway, &parts, accepted).await
}

async fn handle_delegated_routing<R: ContentRouting>(
    State(gateway): State<Arc<Gateway<R>>>,
    Path(segment): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    discard_body(body).await;
    let accepted =
        DelegatedRoutingLookupWriter::accept_cid(&segment, &parts.headers, gateway.config(), true);
    complete_lookup(gateway, &parts, accepted).await
}

async fn complete_lookup<R: ContentRouting>(
    gateway: Arc<Gateway<R>>,
    parts: &Parts,
    accepted: Result<WriterParts, HttpError>,
) -> Response {
    let writer_parts = match accepted {
        Ok(writer_parts) => writer_parts,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = check_cascade_query_param(gateway.config(), parts.uri.query()) {
        return e.into_response();
    }
    run_lookup(gateway, writer_parts).await
}

/// Drives one accepted lookup: spawns the discovery engine and pumps its
/// records through the writer. In streaming mode the response is committed
/// once the first record arrives; the remaining records flow through a
/// detached task feeding the body, one flushed frame per record.
async fn run_lookup<R: ContentRouting>(gateway: Arc<Gateway<R>>, parts: WriterParts) -> Response {
    let WriterParts { mut writer, frames } = parts;
    let mut providers = gateway.engine.cascade_find_providers(writer.key().cid());

    match writer.mode() {
        ResponseMode::Buffered => {
            while let Some(record) = providers.recv().await {
                if let Err(e) = writer.write_record(record).await {
                    debug!(err = %e, "failed to buffer lookup result");
                    break;
                }
            }
            finish_writer(writer).await
        }
        ResponseMode::Streaming => {
            let Some(first) = providers.recv().await else {
                return finish_writer(writer).await;
            };
            let Some(frames) = frames else {
                return HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "").into_response();
            };
            let headers = writer.headers().clone();
            let _ = tokio::spawn(async move {
                let mut record = Some(first);
                loop {
                    let Some(next) = record.take() else { break };
                    if let Err(e) = writer.write_record(next).await {
                        debug!(err = %e, "failed to stream lookup result");
                        break;
                    }
                    record = providers.recv().await;
                }
                if let Err(e) = writer.finish().await {
                    debug!(status = %e.status, "lookup stream closed");
                }
                // `providers` drops here, cancelling the engine.
            });

            let body = Body::from_stream(ReceiverStream::new(frames).map(Ok::<_, Infallible>));
            let mut response = Response::new(body);
            *response.headers_mut() = headers;
            response
        }
    }
}

async fn finish_writer(writer: Box<dyn LookupResponseWriter>) -> Response {
    match writer.finish().await {
        Ok(Some(response)) => response,
        Ok(None) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

fn check_cascade_query_param(config: &GatewayConfig, query: Option<&str>) -> Result<(), HttpError> {
    if !config.ipni_require_cascade_query_param {
        return Ok(());
    }
    let matched = query.is_some_and(|query| {
        form_urlencoded::parse(query.as_bytes())
            .any(|(key, value)| key == "cascade" && value == config.ipni_cascade_label)
    });
    if matched {
        Ok(())
    } else {
        Err(HttpError::not_found())
    }
}

async fn handle_preflight<R: ContentRouting>(
    State(gateway): State<Arc<Gateway<R>>>,
    request: Request,
) -> Response {
    discard_body(request.into_body()).await;
    let config = gateway.config();
    let mut response = StatusCode::ACCEPTED.into_response();
    let headers = response.headers_mut();
    if let Ok(origin) = HeaderValue::from_str(&config.http_allow_origin) {
        let _ = headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    let _ = headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    let _ = headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    if let Ok(label) = HeaderValue::from_str(&config.ipni_cascade_label) {
        let _ = headers.insert(HEADER_IPNI_ALLOW_CASCADE, label);
    }
    response
}

async fn handle_ready(request: Request) -> Response {
    discard_body(request.into_body()).await;
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-cache")],
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
    )
        .into_response()
}

async fn handle_ready_method_not_allowed(request: Request) -> Response {
    discard_body(request.into_body()).await;
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET")],
        "",
    )
        .into_response()
}

async fn handle_not_found(request: Request) -> Response {
    discard_body(request.into_body()).await;
    StatusCode::NOT_FOUND.into_response()
}

async fn handle_not_implemented(request: Request) -> Response {
    discard_body(request.into_body()).await;
    StatusCode::NOT_IMPLEMENTED.into_response()
}

async fn discard_body(body: Body) {
    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        if chunk.is_err() {
            break;
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// A running gateway; dropping it does not stop the server, call
/// [`GatewayHandle::shutdown`].
pub struct GatewayHandle {
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    standard: Arc<KadRouter>,
    accelerated: Option<Arc<KadRouter>>,
    local_addr: SocketAddr,
}

impl Gateway<KadRouter> {
    /// Starts the DHT clients and the HTTP server.
    pub async fn start(config: GatewayConfig) -> Result<GatewayHandle> {
        let shutdown = CancellationToken::new();
        let peerstore = Arc::new(Peerstore::new());

        let standard = Arc::new(KadRouter::spawn(
            &config,
            RouterMode::Standard,
            Arc::clone(&peerstore),
        )?);
        let accelerated = if config.use_accelerated_dht {
            Some(Arc::new(KadRouter::spawn(
                &config,
                RouterMode::Accelerated,
                Arc::clone(&peerstore),
            )?))
        } else {
            None
        };
        let selector = RoutingSelector::new(Arc::clone(&standard), accelerated.clone());

        let listener = TcpListener::bind(config.http_listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let gateway = Arc::new(Gateway::new(config, selector, peerstore, shutdown.clone()));
        let app = router(gateway);
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
            }
        });

        info!(addr = %local_addr, "server started");
        Ok(GatewayHandle {
            shutdown,
            server,
            standard,
            accelerated,
            local_addr,
        })
    }
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections, cancels in-flight lookups, and closes
    /// the routing clients.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.server.await??;
        self.standard.shutdown().await;
        if let Some(accelerated) = &self.accelerated {
            accelerated.shutdown().await;
        }
        Ok(())
    }
}
