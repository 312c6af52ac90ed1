//! Cluster RPC plane: shard-transfer handlers and the interceptor stack.
//!
//! Wire servers live outside the core; what lives here is everything a
//! transport wraps: the receiving side of `TransferShard` streams, an
//! in-process transport for single-node and test topologies, and the
//! fixed interceptor stack (innermost to outermost:
//! Recovery → Auth → Logging) every cluster RPC passes through.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::cluster::rebalance::{ShardStream, ShardTransport, TransferAck, TransferFrame};
use crate::domain::Session;
use crate::error::{Error, Result};
use crate::storage::StorageEngine;

// ---------------------------------------------------------------------------
// TransferShard receiver

/// Receiving side of shard migration streams.
pub struct TransferReceiver {
    storage: Option<Arc<dyn StorageEngine>>,
}

impl TransferReceiver {
    pub fn new(storage: Option<Arc<dyn StorageEngine>>) -> Self {
        Self { storage }
    }

    /// Start accepting one shard stream. Requires storage to be
    /// configured on this node.
    pub fn begin(&self) -> Result<ShardReceive> {
        let Some(storage) = self.storage.clone() else {
            return Err(Error::FailedPrecondition(
                "shard transfer requires storage to be configured".into(),
            ));
        };
        Ok(ShardReceive {
            storage,
            applied: 0,
            skipped: 0,
        })
    }
}

/// State of one in-flight inbound shard stream.
pub struct ShardReceive {
    storage: Arc<dyn StorageEngine>,
    applied: u64,
    skipped: u64,
}

impl std::fmt::Debug for ShardReceive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReceive")
            .field("applied", &self.applied)
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl ShardReceive {
    /// Apply one frame. Undecodable records are counted and skipped; a
    /// storage failure aborts the whole stream.
    pub async fn apply_frame(&mut self, frame: TransferFrame) -> Result<()> {
        let session: Session = match serde_json::from_slice(&frame.session_data) {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    shard = frame.shard_id,
                    session_id = %frame.session_id,
                    error = %e,
                    "undecodable migration record skipped"
                );
                self.skipped += 1;
                return Ok(());
            }
        };
        self.storage
            .create(&session)
            .await
            .map_err(|e| Error::Internal(format!("migration apply failed: {e}")))?;
        self.applied += 1;
        Ok(())
    }

    pub fn finish(self) -> TransferAck {
        TransferAck {
            ok: true,
            applied: self.applied,
            skipped: self.skipped,
            message: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// In-process transport

/// Routes shard streams to in-process receivers by node id.
///
/// Stands in for the network transport in single-node deployments and
/// tests; a real deployment registers a TLS-backed client here instead.
#[derive(Default)]
pub struct LocalShardTransport {
    receivers: DashMap<String, Arc<TransferReceiver>>,
}

impl LocalShardTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, receiver: Arc<TransferReceiver>) {
        self.receivers.insert(node_id.to_owned(), receiver);
    }
}

#[async_trait]
impl ShardTransport for LocalShardTransport {
    async fn open(&self, target_node: &str) -> Result<Box<dyn ShardStream>> {
        let Some(receiver) = self.receivers.get(target_node) else {
            return Err(Error::FailedPrecondition(format!(
                "no transfer route to node '{target_node}'"
            )));
        };
        let inner = receiver.begin()?;
        Ok(Box::new(LocalShardStream { inner }))
    }
}

struct LocalShardStream {
    inner: ShardReceive,
}

#[async_trait]
impl ShardStream for LocalShardStream {
    async fn send(&mut self, frame: TransferFrame) -> Result<()> {
        self.inner.apply_frame(frame).await
    }

    async fn finish(self: Box<Self>) -> Result<TransferAck> {
        Ok(self.inner.finish())
    }
}

// ---------------------------------------------------------------------------
// mTLS peer authentication

/// TLS-layer facts about the calling peer, injected by the transport
/// middleware that terminated the connection.
#[derive(Debug, Clone, Default)]
pub struct TlsPeerInfo {
    /// Peer certificate chain in DER, leaf first.
    pub certificates: Vec<Vec<u8>>,
}

/// Authenticates cluster peers by client certificate.
///
/// Without a CA pool the authenticator is permissive (development only;
/// warns once). With one, callers must present a currently-valid,
/// non-CA client certificate that chains to the pool and carries a
/// non-empty subject CN; `strict_node_id_check` additionally pins the CN
/// to the allowed-nodes set, which is updatable at runtime.
pub struct NodeAuthenticator {
    ca_certs: Vec<Vec<u8>>,
    strict_node_id_check: bool,
    allowed_nodes: RwLock<HashSet<String>>,
    permissive_warned: AtomicBool,
}

impl NodeAuthenticator {
    pub fn permissive() -> Self {
        Self {
            ca_certs: Vec::new(),
            strict_node_id_check: false,
            allowed_nodes: RwLock::new(HashSet::new()),
            permissive_warned: AtomicBool::new(false),
        }
    }

    pub fn new(
        ca_certs_der: Vec<Vec<u8>>,
        strict_node_id_check: bool,
        allowed_nodes: HashSet<String>,
    ) -> Self {
        Self {
            ca_certs: ca_certs_der,
            strict_node_id_check,
            allowed_nodes: RwLock::new(allowed_nodes),
            permissive_warned: AtomicBool::new(false),
        }
    }

    /// Replace the allowed-node set, e.g. after membership changes.
    pub fn set_allowed_nodes(&self, nodes: HashSet<String>) {
        *self
            .allowed_nodes
            .write()
            .expect("allowed nodes lock poisoned") = nodes;
    }

    /// Authenticate a peer, returning its certificate CN (None in
    /// permissive mode).
    pub fn authenticate(&self, peer: Option<&TlsPeerInfo>) -> Result<Option<String>> {
        if self.ca_certs.is_empty() {
            if !self.permissive_warned.swap(true, Ordering::Relaxed) {
                warn!("cluster rpc auth is permissive: no client CA configured");
            }
            return Ok(None);
        }

        let leaf_der = peer
            .and_then(|p| p.certificates.first())
            .ok_or_else(|| Error::Unauthenticated("client certificate required".into()))?;

        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| Error::Unauthenticated(format!("unparseable client certificate: {e}")))?;

        if !leaf.validity().is_valid() {
            return Err(Error::Unauthenticated(
                "client certificate outside its validity window".into(),
            ));
        }

        if let Ok(Some(bc)) = leaf.basic_constraints()
            && bc.value.ca
        {
            return Err(Error::Unauthenticated(
                "CA certificates cannot authenticate as peers".into(),
            ));
        }

        let has_client_auth = leaf
            .extended_key_usage()
            .ok()
            .flatten()
            .is_some_and(|eku| eku.value.client_auth);
        if !has_client_auth {
            return Err(Error::Unauthenticated(
                "client certificate lacks clientAuth extended key usage".into(),
            ));
        }

        if !self.chains_to_pool(&leaf) {
            return Err(Error::Unauthenticated(
                "client certificate does not chain to the cluster CA".into(),
            ));
        }

        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default();
        if cn.is_empty() {
            return Err(Error::Unauthenticated(
                "client certificate subject CN is empty".into(),
            ));
        }

        if self.strict_node_id_check {
            let allowed = self
                .allowed_nodes
                .read()
                .expect("allowed nodes lock poisoned");
            if !allowed.contains(cn) {
                return Err(Error::Unauthenticated(format!(
                    "node '{cn}' is not in the allowed set"
                )));
            }
        }

        Ok(Some(cn.to_owned()))
    }

    fn chains_to_pool(&self, leaf: &X509Certificate<'_>) -> bool {
        self.ca_certs.iter().any(|ca_der| {
            let Ok((_, ca)) = X509Certificate::from_der(ca_der) else {
                return false;
            };
            leaf.issuer() == ca.subject() && leaf.verify_signature(Some(ca.public_key())).is_ok()
        })
    }
}

// ---------------------------------------------------------------------------
// Interceptor stack

/// One cluster RPC as seen by the interceptor stack.
pub struct RpcRequest {
    pub method: &'static str,
    pub peer: Option<TlsPeerInfo>,
    pub payload: Vec<u8>,
}

/// Fixed interceptor stack for the cluster RPC plane.
pub struct InterceptorStack {
    auth: Arc<NodeAuthenticator>,
}

impl InterceptorStack {
    pub fn new(auth: Arc<NodeAuthenticator>) -> Self {
        Self { auth }
    }

    /// Run a handler under Recovery → Auth → Logging (Recovery innermost).
    pub async fn call<F, Fut>(&self, req: RpcRequest, handler: F) -> Result<Vec<u8>>
    where
        F: FnOnce(RpcRequest) -> Fut,
        Fut: Future<Output = Result<Vec<u8>>> + Send,
    {
        let method = req.method;
        let start = Instant::now();

        let result = match self.auth.authenticate(req.peer.as_ref()) {
            Err(e) => Err(e),
            Ok(peer_cn) => {
                debug!(method, peer = peer_cn.as_deref().unwrap_or("-"), "rpc accepted");
                // Recovery: a panicking handler becomes an Internal error
                // instead of tearing down the server task.
                match std::panic::AssertUnwindSafe(handler(req)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_owned())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".into());
                        Err(Error::Internal(format!("handler panicked: {msg}")))
                    }
                }
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(method, elapsed_ms, "rpc ok"),
            Err(e) => warn!(method, elapsed_ms, code = e.code(), "rpc failed: {e}"),
        }
        result
    }
}
