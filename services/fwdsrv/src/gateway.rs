//! Gateway lifecycle: start and stop

use std::net::SocketAddr;
use std::sync::Arc;

use errors::{ServiceError, ServiceResult};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::GatewayConfig;
use crate::handler::RequestHandler;
use crate::ingress;
use crate::monitor::HealthMonitor;
use crate::routing::RoutingTable;

async fn bind_listener(addr: SocketAddr) -> ServiceResult<(TcpListener, SocketAddr)> {
    let bind_error = |e: std::io::Error| ServiceError::Bind {
        addr: addr.to_string(),
        reason: e.to_string(),
    };
    let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;
    Ok((listener, local_addr))
}

/// A running gateway
pub struct Gateway {
    routing: Arc<RoutingTable>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

impl Gateway {
    /// Open every backend, bind the listener and start serving.
    ///
    /// Fails without serving if any backend cannot be opened or the
    /// listener cannot bind.
    pub async fn start(config: &GatewayConfig) -> ServiceResult<Self> {
        let routing = Arc::new(RoutingTable::initialize(&config.servers).await?);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        let (listener, local_addr) = match bind_listener(addr).await {
            Ok(bound) => bound,
            Err(e) => {
                routing.close_all().await;
                return Err(e);
            },
        };
        info!("Gateway listening on {}", local_addr);

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let handler = Arc::new(RequestHandler::new(routing.clone()));

        tracker.spawn(ingress::run_accept_loop(
            listener,
            handler,
            shutdown.clone(),
            tracker.clone(),
        ));
        tracker.spawn(
            HealthMonitor::new(routing.clone(), config.health_check_interval)
                .run(shutdown.clone()),
        );

        Ok(Self {
            routing,
            shutdown,
            tracker,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Stop accepting, close every backend once and wait for all tasks
    pub async fn stop(self) {
        info!("Gateway stopping");
        self.shutdown.cancel();
        self.routing.close_all().await;

        self.tracker.close();
        self.tracker.wait().await;
        info!("Gateway stopped");
    }
}
