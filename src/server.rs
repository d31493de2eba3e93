//! Accept loop, Redis link wiring and signal-driven shutdown.
//!
//! Everything runs on one current-thread runtime inside a `LocalSet`; the
//! manager and the connection registry are `Rc<RefCell<..>>` shared between
//! tasks, never locked. Only startup failures (bind, TLS material) abort
//! the process; everything after that is per-connection and recoverable.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::rc::Rc;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Args;
use crate::connection;
use crate::errors::GatewayError;
use crate::pubsub::{LinkState, PubSubManager, RedisLinks, SocketId};
use crate::redis_link;

/// State threaded through the server loop into every connection. Kept as an
/// explicit parameter rather than process-wide statics.
pub struct ServerCtx {
    pub manager: Rc<RefCell<PubSubManager>>,
    pub registry: Rc<RefCell<HashMap<SocketId, JoinHandle<()>>>>,
    pub tls: Option<TlsAcceptor>,
    pub shutdown: CancellationToken,
    next_socket: Cell<u64>,
}

impl ServerCtx {
    pub fn new(
        manager: Rc<RefCell<PubSubManager>>,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            registry: Rc::new(RefCell::new(HashMap::new())),
            tls,
            shutdown,
            next_socket: Cell::new(1),
        }
    }

    pub fn next_id(&self) -> SocketId {
        let id = self.next_socket.get();
        self.next_socket.set(id + 1);
        SocketId(id)
    }
}

fn tls_acceptor(args: &Args) -> Result<Option<TlsAcceptor>, GatewayError> {
    if !args.use_ssl {
        return Ok(None);
    }
    let chain_path = args
        .ssl_certificate_chain
        .as_ref()
        .ok_or_else(|| GatewayError::Tls("--ssl_certificate_chain is required".into()))?;
    let key_path = args
        .ssl_private_key
        .as_ref()
        .ok_or_else(|| GatewayError::Tls("--ssl_private_key is required".into()))?;

    let mut chain_reader = BufReader::new(File::open(chain_path)?);
    let certs = rustls_pemfile::certs(&mut chain_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("bad certificate chain: {e}")))?;
    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| GatewayError::Tls(format!("bad private key: {e}")))?
        .ok_or_else(|| GatewayError::Tls("no private key found".into()))?;

    if args.ssl_dh_params.is_some() {
        warn!("--ssl_dh_params is ignored, rustls negotiates ECDHE key exchange");
    }
    debug!(ciphers = %args.ssl_ciphers, "cipher preferences noted, rustls selects from its built-in suites");

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(e.to_string()))?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Bind, wire up Redis, and serve until a signal asks us to stop.
///
/// Must run inside a [`tokio::task::LocalSet`] on a current-thread runtime.
pub async fn run(args: Args) -> Result<(), GatewayError> {
    let listener = TcpListener::bind((args.bind_host.as_str(), args.bind_port)).await?;
    let tls = tls_acceptor(&args)?;
    info!(
        host = %args.bind_host,
        port = args.bind_port,
        tls = tls.is_some(),
        "listening"
    );

    let shutdown = CancellationToken::new();
    let (pub_tx, pub_rx) = tokio::sync::mpsc::unbounded_channel();
    let (sub_tx, sub_rx) = tokio::sync::mpsc::unbounded_channel();
    let state = Rc::new(LinkState::default());
    let manager = Rc::new(RefCell::new(PubSubManager::new(RedisLinks {
        pub_tx,
        sub_tx,
        state: state.clone(),
    })));

    let url = redis_link::redis_url(&args.redis_host, args.redis_port);
    tokio::task::spawn_local(redis_link::run_publisher(
        url.clone(),
        state.clone(),
        pub_rx,
        shutdown.clone(),
    ));
    tokio::task::spawn_local(redis_link::run_subscriber(
        url,
        manager.clone(),
        state,
        sub_rx,
        shutdown.clone(),
    ));

    let ctx = Rc::new(ServerCtx::new(manager, tls, shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::task::spawn_local(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = ctx.next_id();
                    debug!(socket = %id, %peer, "accepted");
                    let token = shutdown.child_token();
                    let task = tokio::task::spawn_local(connection::handle(
                        stream,
                        id,
                        token,
                        ctx.clone(),
                    ));
                    ctx.registry.borrow_mut().insert(id, task);
                }
                Err(error) => {
                    warn!(%error, "accept failed");
                }
            },
        }
    }

    // Give every live connection its orderly teardown before the loop goes.
    let lingering: Vec<JoinHandle<()>> = ctx
        .registry
        .borrow_mut()
        .drain()
        .map(|(_, task)| task)
        .collect();
    info!(connections = lingering.len(), "draining connections");
    for task in lingering {
        let _ = task.await;
    }
    info!("gateway stopped");
    Ok(())
}
