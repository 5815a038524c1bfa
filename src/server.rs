//! HTTP transport shim.
//!
//! Requests arrive as base64-wrapped protobuf payloads on `/get`, `/add`,
//! and `/list`; responses go back the same way. Everything interesting
//! happens in [`StoreService`] — this layer only decodes, dispatches, and
//! encodes, returning 400 for bodies it cannot decode and for requests the
//! service rejects.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::proto;
use crate::service::StoreService;

pub struct ApiServer {
    address: SocketAddr,
    trigger_shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    /// Binds `address` and starts serving in a background task.
    pub fn start(address: SocketAddr, service: Arc<StoreService>) -> ApiServer {
        let (trigger_shutdown, shutdown_signal) = oneshot::channel::<()>();
        let (bound, server) =
            warp::serve(make_routes(service)).bind_with_graceful_shutdown(address, async move {
                let _ = shutdown_signal.await;
            });
        let handle = tokio::spawn(server);
        info!(address = %bound, "Listening for store requests.");
        ApiServer {
            address: bound,
            trigger_shutdown: Some(trigger_shutdown),
            handle: Some(handle),
        }
    }

    /// The address the server actually bound, useful with port 0.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Shuts the server down gracefully and waits for it to finish.
    pub async fn stop(mut self) {
        if let Some(trigger) = self.trigger_shutdown.take() {
            let _ = trigger.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn make_routes(service: Arc<StoreService>) -> BoxedFilter<(impl Reply,)> {
    let with_service = warp::any().map(move || Arc::clone(&service));

    let get = warp::path("get")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_service.clone())
        .and_then(handle_get);
    let add = warp::path("add")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_service.clone())
        .and_then(handle_add);
    let list = warp::path("list")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_service)
        .and_then(handle_list);

    get.or(add).or(list).boxed()
}

async fn handle_get(
    body: Bytes,
    service: Arc<StoreService>,
) -> Result<warp::reply::Response, Infallible> {
    let request: proto::GetRequest = match decode_request(&body) {
        Ok(request) => request,
        Err(reply) => return Ok(reply),
    };
    let response = service.get(request).await;
    let status = response_status(response.success);
    Ok(encode_response(&response, status))
}

async fn handle_add(
    body: Bytes,
    service: Arc<StoreService>,
) -> Result<warp::reply::Response, Infallible> {
    let request: proto::AddRequest = match decode_request(&body) {
        Ok(request) => request,
        Err(reply) => return Ok(reply),
    };
    let response = service.add(request).await;
    let status = response_status(response.success);
    Ok(encode_response(&response, status))
}

async fn handle_list(
    body: Bytes,
    service: Arc<StoreService>,
) -> Result<warp::reply::Response, Infallible> {
    let request: proto::ListRequest = match decode_request(&body) {
        Ok(request) => request,
        Err(reply) => return Ok(reply),
    };
    let response = service.list(request).await;
    let status = response_status(response.success);
    Ok(encode_response(&response, status))
}

fn response_status(success: bool) -> StatusCode {
    if success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

fn decode_request<M: Message + Default>(body: &[u8]) -> Result<M, warp::reply::Response> {
    let text = std::str::from_utf8(body).map_err(|_| bad_request("Invalid body"))?;
    let decoded = base64::decode(text.trim()).map_err(|_| bad_request("Invalid body"))?;
    M::decode(decoded.as_slice()).map_err(|_| bad_request("Invalid request"))
}

fn encode_response<M: Message>(response: &M, status: StatusCode) -> warp::reply::Response {
    let encoded = base64::encode(response.encode_to_vec());
    warp::http::Response::builder()
        .status(status)
        .body(encoded.into())
        .expect("static response parts are valid")
}

fn bad_request(message: &'static str) -> warp::reply::Response {
    warp::http::Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(message.into())
        .expect("static response parts are valid")
}
