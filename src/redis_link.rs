//! The two Redis connections behind the fan-out manager.
//!
//! One multiplexed connection carries `PUBLISH`, a dedicated pub/sub
//! connection carries `SUBSCRIBE`/`UNSUBSCRIBE` and delivers message
//! pushes. Each runs as its own task draining an in-process command queue,
//! so the manager itself never awaits Redis: subscribes commit through
//! [`PubSubManager::commit_subscribe`] when the reply lands here, and
//! connection loss flips the shared [`LinkState`] flags that make the
//! manager return `Disconnected`.
//!
//! Both tasks reconnect with a fixed delay. On reconnect the subscriber
//! re-issues `SUBSCRIBE` for every channel that stayed live locally, since
//! the server side of a pub/sub connection dies with it.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pubsub::{LinkState, PubCommand, PubSubManager, SubCommand};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connection URL for the configured Redis endpoint.
pub fn redis_url(host: &str, port: u16) -> String {
    format!("redis://{host}:{port}/")
}

/// Wait out the reconnect delay; `true` means shut down instead.
async fn reconnect_pause(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(RECONNECT_DELAY) => false,
    }
}

/// Drive the PUBLISH connection until shutdown.
pub async fn run_publisher(
    url: String,
    state: Rc<LinkState>,
    mut commands: mpsc::UnboundedReceiver<PubCommand>,
    shutdown: CancellationToken,
) {
    'connect: while !shutdown.is_cancelled() {
        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(error) => {
                warn!(%error, url, "bad redis url for publish connection");
                if reconnect_pause(&shutdown).await {
                    break;
                }
                continue;
            }
        };
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "publish connection to redis failed");
                if reconnect_pause(&shutdown).await {
                    break;
                }
                continue;
            }
        };
        state.set_pub(true);
        info!("publish connection to redis established");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break 'connect,
                cmd = commands.recv() => match cmd {
                    Some(PubCommand::Publish { channel, payload }) => {
                        let sent: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                            .arg(&channel)
                            .arg(payload.as_slice())
                            .query_async(&mut conn)
                            .await;
                        match sent {
                            Ok(receivers) => {
                                debug!(channel, receivers, "published");
                            }
                            Err(error) => {
                                warn!(%error, channel, "PUBLISH failed, reconnecting");
                                break;
                            }
                        }
                    }
                    None => break 'connect,
                },
            }
        }

        state.set_pub(false);
        if reconnect_pause(&shutdown).await {
            break;
        }
    }
    state.set_pub(false);
}

/// Drive the SUBSCRIBE connection until shutdown.
pub async fn run_subscriber(
    url: String,
    manager: Rc<RefCell<PubSubManager>>,
    state: Rc<LinkState>,
    mut commands: mpsc::UnboundedReceiver<SubCommand>,
    shutdown: CancellationToken,
) {
    'connect: while !shutdown.is_cancelled() {
        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(error) => {
                warn!(%error, url, "bad redis url for subscribe connection");
                if reconnect_pause(&shutdown).await {
                    break;
                }
                continue;
            }
        };
        let pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(error) => {
                warn!(%error, "subscribe connection to redis failed");
                if reconnect_pause(&shutdown).await {
                    break;
                }
                continue;
            }
        };
        let (mut sink, mut stream) = pubsub.split();

        // The server side forgot us with the old connection; restore every
        // channel that still has local subscribers.
        let mut restored = true;
        for channel in manager.borrow().live_channels() {
            if let Err(error) = sink.subscribe(&channel).await {
                warn!(%error, channel, "resubscribe failed");
                restored = false;
                break;
            }
        }
        if !restored {
            if reconnect_pause(&shutdown).await {
                break;
            }
            continue;
        }
        state.set_sub(true);
        info!("subscribe connection to redis established");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break 'connect,
                cmd = commands.recv() => match cmd {
                    Some(SubCommand::Subscribe { channel, socket }) => {
                        match sink.subscribe(&channel).await {
                            Ok(()) => manager.borrow_mut().commit_subscribe(&channel, socket),
                            Err(error) => {
                                warn!(%error, channel, "SUBSCRIBE failed, reconnecting");
                                manager.borrow_mut().abort_subscribe(&channel, socket.id());
                                break;
                            }
                        }
                    }
                    Some(SubCommand::Unsubscribe { channel }) => {
                        // The unsubscribe confirmation itself carries nothing
                        // we act on.
                        if let Err(error) = sink.unsubscribe(&channel).await {
                            warn!(%error, channel, "UNSUBSCRIBE failed, reconnecting");
                            break;
                        }
                    }
                    None => break 'connect,
                },
                msg = stream.next() => match msg {
                    Some(msg) => {
                        let channel = msg.get_channel_name().to_owned();
                        let payload = msg.get_payload_bytes().to_vec();
                        debug!(channel, nbytes = payload.len(), "message push");
                        manager.borrow().dispatch_message(&channel, &payload);
                    }
                    None => {
                        warn!("subscription stream ended, reconnecting");
                        break;
                    }
                },
            }
        }

        state.set_sub(false);
        if reconnect_pause(&shutdown).await {
            break;
        }
    }
    state.set_sub(false);
}
