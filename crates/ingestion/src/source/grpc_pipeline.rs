use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tonic::transport::ClientTlsConfig;
use tracing::{debug, info, warn};
use yellowstone_grpc_client::GeyserGrpcClient;
use yellowstone_grpc_proto::prelude::{subscribe_update, SubscribeRequest, SubscribeRequestPing};

use super::grpc::{build_subscribe_request, record_from_update, GrpcRuntimeConfig};
use super::queue::OverflowPolicy;
use super::{sleep_with_backoff, ConnectionTracker, RecordQueue, SeenSignatures};

/// Owns the α connection lifecycle: connect, subscribe, pump updates, ping,
/// reconnect on any failure. Errors never leave this loop; they are counted
/// and answered with a scheduled reconnect.
pub(super) async fn grpc_stream_loop(
    runtime: Arc<GrpcRuntimeConfig>,
    queue: Arc<RecordQueue>,
    tracker: Arc<ConnectionTracker>,
    policy: OverflowPolicy,
) {
    let mut next_backoff_ms = runtime.reconnect_initial_ms;
    let mut seen = SeenSignatures::new(runtime.seen_signatures_limit, runtime.seen_signatures_ttl);

    loop {
        let connection_id = tracker.begin_connecting();

        let builder = match GeyserGrpcClient::build_from_shared(runtime.grpc_url.clone()) {
            Ok(builder) => builder,
            Err(error) => {
                warn!(error = %error, "invalid grpc endpoint");
                schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
                continue;
            }
        };
        let builder = match builder.x_token(Some(runtime.x_token.as_str())) {
            Ok(builder) => builder,
            Err(error) => {
                warn!(error = %error, "invalid grpc x-token metadata");
                schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
                continue;
            }
        };
        let use_tls = runtime
            .grpc_url
            .trim()
            .to_ascii_lowercase()
            .starts_with("https://");
        let builder = if use_tls {
            match builder.tls_config(ClientTlsConfig::new().with_native_roots()) {
                Ok(builder) => builder,
                Err(error) => {
                    warn!(error = ?error, "invalid grpc TLS config");
                    schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
                    continue;
                }
            }
        } else {
            builder
        };
        let mut client = match builder
            .connect_timeout(Duration::from_millis(runtime.connect_timeout_ms))
            .timeout(Duration::from_millis(runtime.connect_timeout_ms))
            .http2_adaptive_window(true)
            .tcp_nodelay(true)
            .connect()
            .await
        {
            Ok(client) => client,
            Err(error) => {
                warn!(error = ?error, "grpc connect failed");
                schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
                continue;
            }
        };

        let (mut subscribe_tx, mut stream) = match client.subscribe().await {
            Ok(parts) => parts,
            Err(error) => {
                warn!(error = %error, "failed opening grpc subscription stream");
                schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
                continue;
            }
        };
        if let Err(error) = subscribe_tx.send(build_subscribe_request(&runtime)).await {
            warn!(error = %error, "failed sending grpc subscribe request");
            schedule_reconnect(&runtime, &tracker, &mut next_backoff_ms).await;
            continue;
        }

        tracker.set_running();
        next_backoff_ms = runtime.reconnect_initial_ms;
        info!(
            connection_id = %connection_id,
            programs = runtime.watched.len(),
            commitment = runtime.commitment.as_str(),
            "grpc subscription running"
        );

        let mut ping_interval = time::interval(Duration::from_secs(runtime.ping_interval_secs));
        ping_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so keepalives start
        // one interval after connect.
        ping_interval.tick().await;
        let mut ping_id: i32 = 0;
        let idle_timeout = Duration::from_secs(runtime.idle_timeout_secs);

        'stream: loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    ping_id = ping_id.wrapping_add(1);
                    let ping_request = SubscribeRequest {
                        ping: Some(SubscribeRequestPing { id: ping_id }),
                        ..Default::default()
                    };
                    if let Err(error) = subscribe_tx.send(ping_request).await {
                        runtime.telemetry.note_error();
                        warn!(error = %error, "grpc keepalive ping failed");
                        break 'stream;
                    }
                }
                next_update = time::timeout(idle_timeout, stream.next()) => {
                    match next_update {
                        Ok(Some(Ok(update))) => {
                            let created_at_secs = update
                                .created_at
                                .as_ref()
                                .map(|timestamp| timestamp.seconds);
                            let Some(update_oneof) = update.update_oneof else {
                                continue;
                            };
                            match update_oneof {
                                subscribe_update::UpdateOneof::Transaction(tx_update) => {
                                    match record_from_update(tx_update, created_at_secs, &connection_id) {
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
                                                    warn!("record queue closed; stopping grpc stream task");
                                                    return;
                                                }
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(error) => {
                                            runtime.telemetry.note_error();
                                            debug!(error = %error, "failed normalizing grpc transaction update");
                                        }
                                    }
                                }
                                // Server-initiated pings are answered; pongs to
                                // our own pings are consumed silently.
                                subscribe_update::UpdateOneof::Ping(_) => {
                                    let ping_request = SubscribeRequest {
                                        ping: Some(SubscribeRequestPing { id: ping_id }),
                                        ..Default::default()
                                    };
                                    if let Err(error) = subscribe_tx.send(ping_request).await {
                                        runtime.telemetry.note_error();
                                        warn!(error = %error, "grpc ping response failed");
                                        break 'stream;
                                    }
                                }
                                subscribe_update::UpdateOneof::Pong(_) => {}
                                _ => {}
                            }
                        }
                        Ok(Some(Err(error))) => {
                            runtime.telemetry.note_error();
                            warn!(error = %error, "grpc stream error");
                            break 'stream;
                        }
                        Ok(None) => {
                            warn!("grpc stream ended");
                            break 'stream;
                        }
                        Err(_) => {
                            warn!(
                                idle_timeout_seconds = runtime.idle_timeout_secs,
                                "grpc stream idle timeout"
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
    runtime: &GrpcRuntimeConfig,
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
