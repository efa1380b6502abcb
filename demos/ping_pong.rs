use std::time::Duration;

use courier::{
    Envelope, Message, PoolConfig, QueueClient, middleware::LoggingMiddleware,
    transport::InMemoryDriver,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

impl Message for Ping {
    fn message_type() -> &'static str {
        "demo.ping"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Pong {
    seq: u64,
}

impl Message for Pong {
    fn message_type() -> &'static str {
        "demo.pong"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Tick {
    seq: u64,
}

impl Message for Tick {
    fn message_type() -> &'static str {
        "demo.tick"
    }

    #[cfg(feature = "msgpack")]
    fn codec() -> courier::Codec {
        courier::Codec::MsgPack
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let client = QueueClient::builder(InMemoryDriver::default())
        .with_pool_config(
            PoolConfig::default()
                .with_min_size(2)
                .with_prune_interval(Duration::from_secs(5)),
        )
        .with_middleware(LoggingMiddleware)
        .build()
        .unwrap();

    client
        .reply(|ping: Envelope<Ping>| async move { Pong { seq: ping.message.seq } })
        .await
        .into_result()
        .unwrap();

    client
        .subscribe(|tick: Envelope<Tick>| async move {
            tracing::info!(
                seq = tick.message.seq,
                root = ?tick.context.root_message_id,
                "Tick received"
            );
            true
        })
        .await
        .into_result()
        .unwrap();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let mut seq = 0;
    while !cancel.is_cancelled() {
        match client
            .request::<Ping, Pong>(Ping { seq }, None, None)
            .await
        {
            Ok(pong) => {
                let result = client
                    .publish(Tick { seq: pong.message.seq }, Some(&pong.context))
                    .await;
                if let Some(error) = result.error_message() {
                    tracing::warn!(error, "Tick not published");
                }
            }
            Err(error) => tracing::error!(%error, "Ping failed"),
        }
        tracing::info!(health = ?client.check_health(), "Round trip done");

        seq += 1;
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }

    client.dispose().await;
}
