//! Client address resolution.
//!
//! The connection's peer address is the client unless the peer is a
//! trusted proxy. In that case `X-Forwarded-For` is walked from the right
//! and the first hop that is not itself a trusted proxy wins. Entries left
//! of that hop are client-controlled and ignored.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use ipnet::IpNet;

use crate::config::SecurityConfig;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Resolved client address, stored as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Set of proxy networks whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    nets: Arc<Vec<IpNet>>,
}

impl TrustedProxies {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self {
            nets: Arc::new(nets),
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self, ipnet::AddrParseError> {
        let nets = config
            .trusted_proxies
            .iter()
            .map(|cidr| cidr.parse::<IpNet>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(nets))
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let canonical = ip.to_canonical();
        self.nets
            .iter()
            .any(|net| net.contains(&ip) || net.contains(&canonical))
    }

    /// Resolve the client behind `peer`.
    pub fn resolve(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.is_trusted(peer) {
            return peer;
        }

        let mut client = peer;
        // Multiple header lines are one list, in order.
        let hops = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .collect::<Vec<_>>();

        for hop in hops.iter().rev() {
            let Ok(ip) = hop.trim().parse::<IpAddr>() else {
                break;
            };
            client = ip;
            if !self.is_trusted(ip) {
                break;
            }
        }

        client
    }
}

/// Middleware that inserts [`ClientIp`] from the connection info.
///
/// A request that already carries a `ClientIp` is left alone. Without
/// connection info nothing is inserted and downstream stages fail closed.
pub async fn client_ip_middleware(
    State(proxies): State<TrustedProxies>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<ClientIp>().is_none() {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        match peer {
            Some(peer) => {
                let ip = proxies.resolve(peer, request.headers());
                request.extensions_mut().insert(ClientIp(ip));
            }
            None => tracing::warn!("No connection info on request; client address unknown"),
        }
    }

    next.run(request).await
}
