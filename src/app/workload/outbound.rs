use crate::core::correlation::context::TaskContext;
use crate::core::correlation::propagation::OutboundHeaders;
use anyhow::Error;
use reqwest::Client;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};
use url::Url;

pub const OP_HTTP_REQ_WITH_TRACE: &str = "http_req_with_trace";
pub const OP_SEND_HTML_REQUEST: &str = "send_html_request";

async fn fetch(client: &Client, url: &Url, headers: HeaderMap) -> Result<usize, reqwest::Error> {
    let body = client
        .get(url.clone())
        .headers(headers)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    Ok(body.len())
}

/// One traced GET, carrying the span as `traceparent`. Failures end up
/// on the span only
async fn send_html_request(ctx: &TaskContext, client: &Client, url: &Url) {
    let (mut span, ctx) = ctx.child_span(OP_SEND_HTML_REQUEST, Vec::new());

    let mut headers = HeaderMap::new();
    ctx.carrier().inject(&mut OutboundHeaders(&mut headers));

    match fetch(client, url, headers).await {
        Ok(len) => debug!(url = %url, len, "Outbound response received"),
        Err(e) => {
            warn!(url = %url, "Outbound request failed: {}", e);
            span.record_error(e);
        }
    }

    span.end();
}

/// `repeats` sequential traced requests. Never fails, unreachable
/// targets only mark the request spans
pub async fn run(ctx: TaskContext, client: Client, url: Url, repeats: u32) -> Result<(), Error> {
    for _ in 0..repeats {
        send_html_request(&ctx, &client, &url).await;
    }

    Ok(())
}
