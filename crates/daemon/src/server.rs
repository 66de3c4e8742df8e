//! mTLS control endpoint
//!
//! Only clients presenting a certificate issued by the mesh root complete
//! the handshake. The acceptor attaches the certificate's Common Name to
//! every request on the connection as a `PeerIdentity` extension.

use crate::join::{Caller, JoinCommand, JoinReply, JoinService};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::StatusCode,
    middleware::AddExtension,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use axum_server::{
    accept::Accept,
    tls_rustls::{RustlsAcceptor, RustlsConfig},
    Handle,
};
use futures::future::BoxFuture;
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Verified identity of the client on this connection
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub common_name: String,
}

#[derive(Clone)]
struct AppState {
    join: Arc<JoinService>,
}

pub fn control_router(join: Arc<JoinService>) -> Router {
    Router::new()
        .route("/commands/join", post(join_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { join })
}

async fn healthz() -> &'static str {
    "ok"
}

/// Every client-side failure gets this same response
fn rejected() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "join request rejected" })),
    )
        .into_response()
}

async fn join_handler(
    State(state): State<AppState>,
    peer: Option<Extension<PeerIdentity>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<JoinCommand>, JsonRejection>,
) -> Response {
    let remote_addr = remote.map(|ConnectInfo(addr)| addr);
    let Some(Extension(peer)) = peer else {
        warn!(remote = ?remote_addr, "Join attempt without a verified client identity");
        return rejected();
    };
    let Json(command) = match body {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, remote = ?remote_addr, "Malformed join body");
            return rejected();
        }
    };

    let caller = Caller {
        common_name: peer.common_name,
        remote_addr,
    };
    match state
        .join
        .redeem_join_token(&command.join_token, &caller)
        .await
    {
        Ok(node) => (StatusCode::OK, Json(JoinReply { node })).into_response(),
        Err(e) if e.is_client_error() => {
            info!(
                request_id = %caller.common_name,
                remote = ?caller.remote_addr,
                error = %e,
                "Join request rejected"
            );
            rejected()
        }
        Err(e) => {
            error!(request_id = %caller.common_name, error = %e, "Join request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

fn peer_common_name(conn: &rustls::ServerConnection) -> Option<String> {
    let der = conn.peer_certificates()?.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    let common_name = cert.subject().iter_common_name().next()?.as_str().ok()?;
    Some(common_name.to_string())
}

/// TLS acceptor that tags each connection with its client's Common Name
#[derive(Clone)]
pub struct PeerIdentityAcceptor {
    inner: RustlsAcceptor,
}

impl PeerIdentityAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config).handshake_timeout(Duration::from_secs(10)),
        }
    }
}

impl<I, S> Accept<I, S> for PeerIdentityAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerIdentity>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let common_name = peer_common_name(stream.get_ref().1).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "client certificate has no common name",
                )
            })?;
            let service = Extension(PeerIdentity { common_name }).layer(service);
            Ok((stream, service))
        })
    }
}

/// Serve the control endpoint on `listener` until `handle` shuts it down.
pub async fn serve(
    listener: std::net::TcpListener,
    tls: Arc<rustls::ServerConfig>,
    join: Arc<JoinService>,
    handle: Handle,
) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let acceptor = PeerIdentityAcceptor::new(RustlsConfig::from_config(tls));

    info!(%addr, "Control endpoint listening");
    axum_server::from_tcp(listener)
        .acceptor(acceptor)
        .handle(handle)
        .serve(control_router(join).into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    info!("Control endpoint stopped");
    Ok(())
}
