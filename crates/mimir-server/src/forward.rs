use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use mimir_types::MimirError;

use crate::handlers::json_error;
use crate::AppState;

/// Cap on buffered request bodies when relaying to the leader.
const MAX_PROXY_BODY: usize = 64 * 1024 * 1024;

/// Funnels every client request through the current leader.
///
/// Leaders handle locally, so forwarding can never loop. A follower with no
/// elected leader lets the request proceed locally; the write path then
/// reports the missing leader itself. A follower with a stale leader address
/// may misdirect the proxy, which surfaces as a not-leader error the client
/// retries.
pub(crate) async fn forward_to_leader(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.node.is_leader() {
        return next.run(req).await;
    }
    let Some(leader) = state.node.leader_api_addr() else {
        tracing::error!("leader address is empty");
        return next.run(req).await;
    };
    match proxy(&state.http, &leader, req).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, %leader, "proxy to leader failed");
            json_error(e)
        }
    }
}

// Replays the request against the leader verbatim: method, path, query,
// headers, body. The response streams back unchanged.
async fn proxy(
    client: &reqwest::Client,
    leader: &str,
    req: Request,
) -> Result<Response, MimirError> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_PROXY_BODY)
        .await
        .map_err(|e| MimirError::Io(e.to_string()))?;

    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = format!("http://{leader}{path_and_query}");

    let mut headers = parts.headers;
    // The client derives Host from the target URL.
    headers.remove(header::HOST);

    let upstream = client
        .request(parts.method, &url)
        .headers(headers)
        .body(bytes)
        .send()
        .await
        .map_err(|e| MimirError::Io(e.to_string()))?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let body = upstream.bytes().await.map_err(|e| MimirError::Io(e.to_string()))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body)).map_err(|e| MimirError::Io(e.to_string()))
}
