use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::queue::OverflowPolicy;
use super::ws::{build_subscribe_request, parse_frame, record_from_notification, WsFrame, WsRuntimeConfig};
use super::{sleep_with_backoff, ConnectionTracker, RecordQueue, SeenSignatures};

/// Owns the β connection lifecycle. One subscription request per connection;
/// the returned subscription id is remembered for the session. Any stream
/// failure schedules a reconnect; nothing propagates to callers.
pub(super) async fn ws_stream_loop(
    runtime: Arc<WsRuntimeConfig>,
    queue: Arc<RecordQueue>,
    tracker: Arc<ConnectionTracker>,
    policy: OverflowPolicy,
) {
    let mut next_backoff_ms = runtime.reconnect_initial_ms;
    let mut request_id: u64 = 0;
    let mut seen = SeenSignatures::new(runtime.seen_signatures_limit, runtime.seen_signatures_ttl);

    loop {
        let connection_id = tracker.begin_connecting();
        request_id = request_id.saturating_add(1);

        let connect_timeout = Duration::from_millis(runtime.connect_timeout_ms);
        let mut ws = match time::timeout(connect_timeout, connect_async(&runtime.ws_url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(error)) => {
                warn!(error = %error, "ws connect failed");
                schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
                continue;
            }
            Err(_) => {
                warn!(
                    connect_timeout_ms = runtime.connect_timeout_ms,
                    "ws connect handshake timed out"
                );
                schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
                continue;
            }
        };

        let request = build_subscribe_request(request_id, &runtime);
        if let Err(error) = ws.send(Message::Text(request.into())).await {
            warn!(error = %error, "failed sending transaction subscription");
            schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
            continue;
        }

        tracker.set_running();
        next_backoff_ms = runtime.reconnect_initial_ms;
        info!(
            connection_id = %connection_id,
            programs = runtime.watched.len(),
            commitment = runtime.commitment.as_str(),
            "ws subscription request sent"
        );

        let mut subscription_id: Option<u64> = None;
        let mut ping_interval = time::interval(Duration::from_secs(runtime.ping_interval_secs));
        ping_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ping_interval.tick().await;
        let idle_timeout = Duration::from_secs(runtime.idle_timeout_secs);

        'stream: loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if let Err(error) = ws.send(Message::Ping(Vec::new().into())).await {
                        runtime.telemetry.note_error();
                        warn!(error = %error, "ws keepalive ping failed");
                        break 'stream;
                    }
                }
                next_message = time::timeout(idle_timeout, ws.next()) => {
                    match next_message {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            match parse_frame(&text) {
                                WsFrame::SubscribeAck { request_id: acked, subscription_id: granted } => {
                                    subscription_id = Some(granted);
                                    debug!(request_id = acked, subscription_id = granted, "transaction subscription acknowledged");
                                }
                                WsFrame::Notification(result) => {
                                    match record_from_notification(&result, &connection_id) {
                                        Ok(Some(record)) => {
                                            if seen.check_and_mark(&record.signature, Instant::now()) {
                                                runtime.telemetry.note_duplicate_drop();
                                                continue;
                                            }
                                            match queue.push(record, policy).await {
                                                Some(outcome) => {
                                                    if outcome.backpressured {
                                                        runtime.telemetry.note_queue_backpressured();
                                                    }
                                                    if outcome.replaced_oldest {
                                                        runtime.telemetry.note_queue_replaced_oldest();
                                                    }
                                                }
                                                None => {
                                                    warn!("record queue closed; stopping ws stream task");
                                                    return;
                                                }
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(error) => {
                                            runtime.telemetry.note_error();
                                            debug!(error = %error, "failed normalizing ws notification");
                                        }
                                    }
                                }
                                WsFrame::RpcError(message) => {
                                    runtime.telemetry.note_error();
                                    warn!(error = %message, "ws rpc error frame");
                                }
                                WsFrame::Other => {}
                            }
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            if let Err(error) = ws.send(Message::Pong(payload)).await {
                                runtime.telemetry.note_error();
                                warn!(error = %error, "failed answering ws ping");
                                break 'stream;
                            }
                        }
                        Ok(Some(Ok(Message::Pong(_)))) => {}
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            warn!(?frame, subscription_id, "ws closed by server");
                            break 'stream;
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(error))) => {
                            runtime.telemetry.note_error();
                            warn!(error = %error, "ws stream error");
                            break 'stream;
                        }
                        Ok(None) => {
                            warn!("ws stream ended");
                            break 'stream;
                        }
                        Err(_) => {
                            warn!(
                                idle_timeout_seconds = runtime.idle_timeout_secs,
                                "ws idle timeout"
                            );
                            break 'stream;
                        }
                    }
                }
            }
        }

        schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
    }
}

async fn schedule_reconnect(
    runtime: &WsRuntimeConfig,
    tracker: &ConnectionTracker,
    next_backoff_ms: &mut u64,
) {
    runtime.telemetry.note_error();
    runtime.telemetry.note_reconnect();
    tracker.set_reconnecting();
    sleep_with_backoff(
        next_backoff_ms,
        runtime.reconnect_initial_ms,
        runtime.reconnect_max_ms,
    )
    .await;
}
