//! HTTP adapter exposing one device.
//!
//! Each device gets its own listener on its derived port. The adapter keeps no
//! state of its own beyond the socket; every request is answered from the
//! [`DeviceManager`](crate::DeviceManager).

mod description;
mod routes;

pub use description::{description_xml, DEVICE_TYPE};
pub use routes::{DeviceRoutes, DeviceStatus, Listing};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Response type produced by every route.
pub type HttpResponse = hyper::Response<BoxBody<Bytes, std::io::Error>>;

/// Result of building a response.
pub type HttpResult<E = std::io::Error> = std::result::Result<HttpResponse, E>;

/// A listener bound to a device's port, not yet serving.
///
/// Holding one proves the port is bound, which is what the beacon needs
/// before it may advertise the address.
#[derive(Debug)]
pub struct HttpServer {
    /// The bound socket.
    listener: TcpListener,
    /// Address actually bound.
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the port cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        debug!("HTTP listener bound on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self, routes: DeviceRoutes) {
        info!(
            "HTTP adapter for {} listening on {}",
            routes.device().identity(),
            self.local_addr
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("HTTP connection from {}", peer);
                    tokio::spawn(handle_connection(stream, routes.clone()));
                }
                Err(e) => {
                    warn!("failed to accept: {}", e);
                    continue;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, routes: DeviceRoutes) {
    let io = hyper_util::rt::TokioIo::new(stream);

    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::tokio::TokioExecutor::new());

    let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        let routes = routes.clone();
        async move { routes.route(request.method(), request.uri()).await }
    });

    if let Err(e) = builder.serve_connection(io, service).await {
        debug!("connection error: {:?}", e);
    }
}

/// Serialize `o` as a JSON response with the given status.
pub fn json_with_status<T: serde::Serialize>(o: T, status: hyper::StatusCode) -> HttpResult {
    let bytes = match serde_json::to_vec(&o) {
        Ok(v) => v,
        Err(e) => return server_error_(format!("failed to serialize json: {e:?}")),
    };
    typed_response(bytes, status, "application/json")
}

/// Serialize `o` as a `200 OK` JSON response.
pub fn json<T: serde::Serialize>(o: T) -> HttpResult {
    json_with_status(o, hyper::StatusCode::OK)
}

fn server_error_(s: String) -> HttpResult {
    bytes_to_resp(s.into_bytes(), hyper::StatusCode::INTERNAL_SERVER_ERROR)
}

/// Plain response with an empty header map.
fn bytes_to_resp(bytes: Vec<u8>, status: hyper::StatusCode) -> HttpResult {
    use http_body_util::BodyExt;

    let mut r = hyper::Response::new(
        http_body_util::Full::new(Bytes::from(bytes))
            .map_err(|e| match e {})
            .boxed(),
    );
    *r.status_mut() = status;
    Ok(r)
}

/// Response with an explicit `Content-Type`.
pub fn typed_response(
    bytes: Vec<u8>,
    status: hyper::StatusCode,
    content_type: &'static str,
) -> HttpResult {
    let mut r = bytes_to_resp(bytes, status)?;
    r.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    Ok(r)
}
