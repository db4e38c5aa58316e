// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The libp2p data-channel surface.
//!
//! One inbound request message carries the same JSON body as
//! `POST /responses`; the response message mirrors the HTTP reply.  The
//! node serves requests sequentially on the swarm loop – per-session
//! concurrency happens below, inside the session manager.

mod codec;

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use libp2p::{
    identity, noise, request_response, swarm::SwarmEvent, tcp, yamux, Multiaddr, PeerId, Swarm,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Dispatcher;

pub use codec::{JsonCodec, RESPONSES_PROTO};

type Behaviour = request_response::Behaviour<JsonCodec>;

/// Data-channel node: a libp2p swarm answering `ResponsesRequest`s.
pub struct P2pNode {
    swarm: Swarm<Behaviour>,
    dispatcher: Arc<Dispatcher>,
}

impl P2pNode {
    /// Build a node listening on `listen`.  A `seed` string derives a
    /// deterministic peer identity (stable across restarts); without one a
    /// fresh identity is generated.
    pub fn new(
        listen: &str,
        seed: Option<&str>,
        dispatcher: Arc<Dispatcher>,
    ) -> anyhow::Result<Self> {
        let keypair = match seed {
            Some(seed) => {
                let mut bytes = [0u8; 32];
                for (i, b) in seed.bytes().take(32).enumerate() {
                    bytes[i] = b;
                }
                identity::Keypair::ed25519_from_bytes(bytes)
                    .context("deriving peer identity from seed")?
            }
            None => identity::Keypair::generate_ed25519(),
        };

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .context("building tcp transport")?
            .with_behaviour(|_| {
                request_response::Behaviour::with_codec(
                    JsonCodec,
                    [(RESPONSES_PROTO, request_response::ProtocolSupport::Full)],
                    request_response::Config::default(),
                )
            })
            .map_err(|e| anyhow::anyhow!("building behaviour: {e}"))?
            .build();

        let addr: Multiaddr = listen.parse().context("invalid p2p listen address")?;
        swarm.listen_on(addr).context("binding p2p listener")?;

        Ok(Self { swarm, dispatcher })
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Serve until the shutdown token fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(peer_id = %self.local_peer_id(), "p2p node running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("p2p node stopping");
                    break;
                }
                event = self.swarm.select_next_some() => self.handle(event).await,
            }
        }
    }

    async fn handle(&mut self, event: SwarmEvent<request_response::Event<crate::ResponsesRequest, crate::ResponsesReply>>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "p2p listening");
            }
            SwarmEvent::Behaviour(request_response::Event::Message {
                peer,
                message: request_response::Message::Request { request, channel, .. },
                ..
            }) => {
                debug!(%peer, "p2p request received");
                let reply = self.dispatcher.dispatch(request).await;
                if self
                    .swarm
                    .behaviour_mut()
                    .send_response(channel, reply)
                    .is_err()
                {
                    warn!(%peer, "p2p response channel closed before reply");
                }
            }
            SwarmEvent::Behaviour(request_response::Event::InboundFailure { peer, error, .. }) => {
                warn!(%peer, %error, "p2p inbound failure");
            }
            other => {
                debug!(?other, "p2p event");
            }
        }
    }
}
