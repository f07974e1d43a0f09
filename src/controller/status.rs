use actix_web::{get, web, HttpResponse, Result};
use futures::stream;
use std::time::Duration;

use crate::{
    configuration::{AppState, State},
    error::Error,
    model::JobKind,
    types::StatusResponse,
};

/// Poll cadence of the push stream; also the freshness bound of the
/// pull query.
const STREAM_POLL: Duration = Duration::from_millis(200);

/// Keepalive comment roughly every 15 seconds of idle stream.
const KEEPALIVE_TICKS: u32 = 75;

async fn read_status(
    state: &AppState<State>,
) -> Result<StatusResponse, Error> {
    let rebalance_processing = state
        .store
        .queue
        .is_processing(Some(JobKind::Rebalance))
        .await?;
    let settlement_processing = state
        .store
        .queue
        .is_processing(Some(JobKind::Settlement))
        .await?;
    let queue_size = state.store.queue.size().await?;
    Ok(StatusResponse {
        processing: rebalance_processing || settlement_processing,
        rebalance_processing,
        settlement_processing,
        queue_size,
    })
}

/// Pull query over the processing records.
#[get("/status")]
pub async fn index(
    state: web::Data<AppState<State>>,
) -> Result<HttpResponse, Error> {
    let status = read_status(&state).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// Server-sent events: emits on every processing-state transition and
/// keeps the connection warm with comment frames.
#[get("/status/stream")]
pub async fn stream_index(
    state: web::Data<AppState<State>>,
) -> Result<HttpResponse, Error> {
    let app = state.get_ref().clone();
    let initial: Option<bool> = None;

    let stream = stream::unfold(
        (app, initial, 0u32),
        |(app, last, mut idle)| async move {
            loop {
                let processing = app
                    .store
                    .queue
                    .is_processing(None)
                    .await
                    .unwrap_or(false);
                if last != Some(processing) {
                    let frame = format!(
                        "data: {}\n\n",
                        serde_json::json!({ "processing": processing })
                    );
                    return Some((
                        Ok::<web::Bytes, Error>(web::Bytes::from(frame)),
                        (app, Some(processing), 0),
                    ));
                }
                idle += 1;
                if idle >= KEEPALIVE_TICKS {
                    return Some((
                        Ok(web::Bytes::from_static(b": keepalive\n\n")),
                        (app, last, 0),
                    ));
                }
                tokio::time::sleep(STREAM_POLL).await;
            }
        },
    );

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(stream))
}
