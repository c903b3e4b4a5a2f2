//! TCP front end and service lifecycle
//!
//! Connections are short-lived: one request line in, one response line out.
//! Every connection gets its own handler task; the accept loop, the
//! handlers, and the sweeper all share the dispatcher handle.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::inventory::{Inventory, InventoryError};
use crate::protocol::{self, ProtocolError, Request, Response};
use crate::sweeper;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// How the service came to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Every block reached a terminal state, or retries ran out.
    Exhausted,
    /// An external interrupt stopped the service mid-run.
    Interrupted,
}

/// A bound listener plus the dispatch state machine behind it.
pub struct BlockService {
    listener: TcpListener,
    dispatcher: Dispatcher,
}

impl BlockService {
    /// Load the block list, set up the dispatcher, and bind the listener.
    pub async fn bind(config: &Config) -> Result<Self, ServiceError> {
        info!(
            "time_limit: {}s, check_interval: {}s, num_retries: {}",
            config.time_limit, config.check_interval, config.num_retries
        );
        match &config.out_prefix {
            Some(prefix) => {
                info!("will serialize shutdown status at: {}", prefix.display())
            }
            None => warn!(
                "will not serialize shutdown status, pass an out prefix to enable it"
            ),
        }

        let inventory = Inventory::load(&config.block_file)?;
        let dispatcher = Dispatcher::new(inventory, DispatchOptions::from_config(config));

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        info!("listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            dispatcher,
        })
    }

    /// The bound address; useful with port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle onto the dispatch state machine.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Serve until the work is exhausted or an interrupt arrives.
    ///
    /// Both exits run the same teardown: stop accepting, let every live
    /// handler finish its response (waiters observe the stopped dispatcher
    /// and answer `stop`), then join the sweeper. By the time this returns
    /// no handler task is left to race a closed socket.
    pub async fn serve(self) -> Result<ServiceOutcome, ServiceError> {
        let Self {
            listener,
            dispatcher,
        } = self;

        let sweeper = tokio::spawn(sweeper::run(dispatcher.clone()));
        let mut shutdown = dispatcher.shutdown_signal();
        let mut handlers: JoinSet<()> = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = shutdown.changed() => break ServiceOutcome::Exhausted,
                _ = tokio::signal::ctrl_c() => {
                    info!("received interrupt, shutting down");
                    dispatcher.serialize_status(true);
                    dispatcher.shutdown();
                    break ServiceOutcome::Interrupted;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let dispatcher = dispatcher.clone();
                        handlers.spawn(async move {
                            if let Err(err) = handle_request(stream, &dispatcher).await {
                                warn!("dropping connection from {peer}: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("failed to accept connection: {err}"),
                }
            }
        };

        drop(listener);
        while handlers.join_next().await.is_some() {}
        if let Err(err) = sweeper.await {
            warn!("sweeper task failed: {err}");
        }
        info!("service stopped");
        Ok(outcome)
    }
}

/// Bind and serve in one call.
pub async fn run_service(config: &Config) -> Result<ServiceOutcome, ServiceError> {
    let service = BlockService::bind(config).await?;
    service.serve().await
}

/// One request, one response. A malformed request drops the connection
/// without a response and without touching the inventory.
async fn handle_request(stream: TcpStream, dispatcher: &Dispatcher) -> Result<(), ServiceError> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    stream.read_line(&mut line).await?;

    let response = match protocol::parse_request(&line)? {
        Request::NextBlock => match dispatcher.request_block().await {
            Some(block) => Response::Assigned(block),
            None => Response::Stop,
        },
        Request::Confirm(block) => {
            if dispatcher.confirm_block(&block) {
                Response::Accepted
            } else {
                Response::Rejected
            }
        }
    };

    let mut reply = protocol::format_response(&response);
    reply.push('\n');
    stream.get_mut().write_all(reply.as_bytes()).await?;
    Ok(())
}
