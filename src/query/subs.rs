use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::chain::{AddressDescriptor, BlockHash};

/// Per-client outgoing queue bound. A client that falls this far behind is
/// closed rather than allowed to block the broadcast.
const CLIENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SubscriptionMessage {
    #[serde(rename_all = "camelCase")]
    NewBlock { height: u32, hash: String },
    #[serde(rename_all = "camelCase")]
    AddressTxid {
        address: String,
        txid: String,
        is_input: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(u64);

struct Client {
    sender: mpsc::Sender<SubscriptionMessage>,
}

/// Fan-out bookkeeping for the two subscription channels: a set of
/// new-block subscribers and a descriptor → subscribers map. Broadcasts
/// copy the recipient list under the lock, then send without it; sends are
/// non-blocking and a full or closed client is dropped from the tables on
/// the next broadcast that touches it.
#[derive(Default)]
pub struct SubscriptionHub {
    next_id: AtomicU64,
    new_block: Mutex<HashMap<ClientHandle, mpsc::Sender<SubscriptionMessage>>>,
    addresses: Mutex<HashMap<AddressDescriptor, HashMap<ClientHandle, mpsc::Sender<SubscriptionMessage>>>>,
    clients: Mutex<HashMap<ClientHandle, Client>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client and returns its handle plus the message stream.
    pub fn register(&self) -> (ClientHandle, mpsc::Receiver<SubscriptionMessage>) {
        let handle = ClientHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(CLIENT_QUEUE);

        self.clients
            .lock()
            .expect("clients lock poisoned")
            .insert(handle, Client { sender });

        (handle, receiver)
    }

    pub fn unregister(&self, handle: ClientHandle) {
        self.clients
            .lock()
            .expect("clients lock poisoned")
            .remove(&handle);
        self.new_block
            .lock()
            .expect("new block lock poisoned")
            .remove(&handle);

        let mut addresses = self.addresses.lock().expect("addresses lock poisoned");
        addresses.retain(|_, subscribers| {
            subscribers.remove(&handle);
            !subscribers.is_empty()
        });
    }

    fn sender_of(&self, handle: ClientHandle) -> Option<mpsc::Sender<SubscriptionMessage>> {
        self.clients
            .lock()
            .expect("clients lock poisoned")
            .get(&handle)
            .map(|c| c.sender.clone())
    }

    pub fn subscribe_new_block(&self, handle: ClientHandle) {
        if let Some(sender) = self.sender_of(handle) {
            self.new_block
                .lock()
                .expect("new block lock poisoned")
                .insert(handle, sender);
        }
    }

    pub fn unsubscribe_new_block(&self, handle: ClientHandle) {
        self.new_block
            .lock()
            .expect("new block lock poisoned")
            .remove(&handle);
    }

    pub fn subscribe_addresses(&self, handle: ClientHandle, descriptors: Vec<AddressDescriptor>) {
        let Some(sender) = self.sender_of(handle) else {
            return;
        };

        let mut addresses = self.addresses.lock().expect("addresses lock poisoned");
        for descriptor in descriptors {
            addresses
                .entry(descriptor)
                .or_default()
                .insert(handle, sender.clone());
        }
    }

    pub fn unsubscribe_addresses(&self, handle: ClientHandle) {
        let mut addresses = self.addresses.lock().expect("addresses lock poisoned");
        addresses.retain(|_, subscribers| {
            subscribers.remove(&handle);
            !subscribers.is_empty()
        });
    }

    pub fn new_block_subscribers(&self) -> usize {
        self.new_block.lock().expect("new block lock poisoned").len()
    }

    /// Broadcasts a committed block to every new-block subscriber.
    pub fn broadcast_new_block(&self, height: u32, hash: &BlockHash) {
        let recipients: Vec<_> = {
            let subscribers = self.new_block.lock().expect("new block lock poisoned");
            subscribers
                .iter()
                .map(|(handle, sender)| (*handle, sender.clone()))
                .collect()
        };

        if recipients.is_empty() {
            return;
        }

        info!(
            "broadcasting new block {height} to {} channels",
            recipients.len()
        );

        let message = SubscriptionMessage::NewBlock {
            height,
            hash: hex::encode(hash),
        };

        for (handle, sender) in recipients {
            self.deliver(handle, &sender, message.clone());
        }
    }

    /// Broadcasts one (address, txid) observation to the subscribers of its
    /// descriptor. The address string is rendered by the caller.
    pub fn broadcast_address_txid(
        &self,
        descriptor: &[u8],
        address: String,
        txid: String,
        is_input: bool,
    ) {
        let recipients: Vec<_> = {
            let addresses = self.addresses.lock().expect("addresses lock poisoned");
            match addresses.get(descriptor) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(handle, sender)| (*handle, sender.clone()))
                    .collect(),
                None => return,
            }
        };

        let message = SubscriptionMessage::AddressTxid {
            address,
            txid,
            is_input,
        };

        for (handle, sender) in recipients {
            self.deliver(handle, &sender, message.clone());
        }
    }

    fn deliver(
        &self,
        handle: ClientHandle,
        sender: &mpsc::Sender<SubscriptionMessage>,
        message: SubscriptionMessage,
    ) {
        match sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("closing slow subscription client {:?}", handle);
                self.unregister(handle);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(handle);
            }
        }
    }
}
