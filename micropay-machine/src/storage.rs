use crate::client::{ClientChannel, ClientStatus};
use crate::config::Config;
use crate::server::{ServerChannel, ServerStatus};
use micropay_wallet::{Broadcaster, Clock};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Keeps finalized channels and fires their fallback broadcasts when the
/// deadline arrives. Client channels fall back to the funding/refund pair
/// shortly after expiry; server channels claim their best payment well
/// before the refund matures.
pub struct ChannelStore {
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    config: Config,
    deadlines: BinaryHeap<Reverse<(u64, Uuid)>>,
    clients: HashMap<Uuid, Arc<Mutex<ClientChannel>>>,
    servers: HashMap<Uuid, Arc<Mutex<ServerChannel>>>,
}

impl ChannelStore {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            broadcaster,
            clock,
            config,
            deadlines: BinaryHeap::new(),
            clients: HashMap::new(),
            servers: HashMap::new(),
        }
    }

    /// Takes over a client channel. No further payments can be made on
    /// it; at `expire_time + client_rebroadcast_delay` the funding and
    /// refund transactions go out, in dependency order.
    pub fn store_client(&mut self, id: Uuid, mut channel: ClientChannel) -> Arc<Mutex<ClientChannel>> {
        channel.mark_stored();
        let deadline = channel.expire_time() + self.config.client_rebroadcast_delay;
        let handle = Arc::new(Mutex::new(channel));
        self.deadlines.push(Reverse((deadline, id)));
        self.clients.insert(id, handle.clone());
        tracing::debug!(%id, deadline, "Stored client channel");
        handle
    }

    /// Takes over a server channel; at `expire_time -
    /// server_close_deadline` the current best payment is broadcast.
    pub fn store_server(&mut self, id: Uuid, channel: ServerChannel) -> Arc<Mutex<ServerChannel>> {
        let deadline = channel
            .expire_time()
            .saturating_sub(self.config.server_close_deadline);
        let handle = Arc::new(Mutex::new(channel));
        self.deadlines.push(Reverse((deadline, id)));
        self.servers.insert(id, handle.clone());
        tracing::debug!(%id, deadline, "Stored server channel");
        handle
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Fires every deadline that has passed; returns how many channels
    /// were acted on.
    pub async fn poll(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(channel) = self.clients.remove(&id) {
                self.rebroadcast_client(id, channel).await;
                fired += 1;
            } else if let Some(channel) = self.servers.remove(&id) {
                self.rebroadcast_server(id, channel).await;
                fired += 1;
            }
        }
        fired
    }

    /// Drives `poll` forever. For callers that hand the store its own
    /// task instead of polling on block arrival.
    pub async fn run(mut self) {
        loop {
            self.poll().await;
            let now = self.clock.now();
            let sleep = self
                .next_deadline()
                .map_or(60, |deadline| deadline.saturating_sub(now).clamp(1, 60));
            tokio::time::sleep(Duration::from_secs(sleep)).await;
        }
    }

    async fn rebroadcast_client(&self, id: Uuid, channel: Arc<Mutex<ClientChannel>>) {
        let mut channel = channel.lock().await;
        let result = async {
            let funding = channel.funding_transaction()?;
            let refund = channel.completed_refund_transaction()?;
            self.broadcaster.broadcast(funding, "multisig contract").await?;
            self.broadcaster.broadcast(refund, "refund").await?;
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                channel.set_state(ClientStatus::Expired);
                tracing::info!(%id, "Expired channel fell back to the refund");
            }
            Err(error) => {
                channel.set_state(ClientStatus::Error);
                tracing::warn!(%id, %error, "Failed to reclaim expired channel");
            }
        }
    }

    async fn rebroadcast_server(&self, id: Uuid, channel: Arc<Mutex<ServerChannel>>) {
        let mut channel = channel.lock().await;
        let payment = match channel.best_payment_transaction() {
            Ok(payment) => payment,
            Err(error) => {
                channel.record_broadcast_failure(error.to_string());
                return;
            }
        };
        match self.broadcaster.broadcast(payment, "best payment").await {
            Ok(txid) => {
                channel.set_state(ServerStatus::Closed);
                tracing::info!(%id, %txid, "Claimed best payment ahead of expiry");
            }
            Err(error) => channel.record_broadcast_failure(error.to_string()),
        }
    }
}
