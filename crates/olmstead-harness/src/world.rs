//! Multi-device world: engines sharing one directory and one virtual clock.
//!
//! Outgoing [`EngineAction::SendToDevice`] effects are queued in send order
//! and delivered by [`World::deliver_all`]. Tests can take the queue to
//! drop, reorder or replay messages before delivery. Every other action is
//! recorded as an event for assertions.

use std::{collections::VecDeque, sync::Arc};

use olmstead_core::{
    CryptoEngine, DeviceKey, EncryptedRoomMessage, EngineAction, EngineConfig, EngineError, MemoryStore, PickleKey,
    RoomId, Store, ToDeviceMessage, UserId,
};
use tracing::{debug, trace};

use crate::{directory::MemoryDirectory, sim_env::SimEnv};

/// Engine type driven by the simulation.
pub type SimEngine<S = MemoryStore> = CryptoEngine<S, MemoryDirectory, SimEnv>;

/// One simulated device.
pub struct TestDevice<S: Store = MemoryStore> {
    /// `(user, device)` of the engine
    pub key: DeviceKey,
    /// The device's engine
    pub engine: Arc<SimEngine<S>>,
}

impl<S: Store> Clone for TestDevice<S> {
    fn clone(&self) -> Self {
        Self { key: self.key.clone(), engine: Arc::clone(&self.engine) }
    }
}

/// A set of devices exchanging to-device messages.
pub struct World<S: Store = MemoryStore> {
    env: SimEnv,
    directory: MemoryDirectory,
    config: EngineConfig,
    devices: Vec<TestDevice<S>>,
    queue: VecDeque<ToDeviceMessage>,
    events: Vec<(DeviceKey, EngineAction)>,
    errors: Vec<(DeviceKey, EngineError)>,
}

impl World<MemoryStore> {
    /// Empty world with in-memory stores.
    pub fn new(seed: u64) -> Self {
        Self::with_env(SimEnv::with_seed(seed))
    }

    /// Add a device backed by a fresh in-memory store.
    pub async fn add_device(&mut self, user: &str, device: &str) -> Result<TestDevice, EngineError> {
        self.add_device_with_store(user, device, MemoryStore::new()).await
    }
}

impl<S: Store> World<S> {
    /// Empty world on an existing environment.
    pub fn with_env(env: SimEnv) -> Self {
        Self {
            env,
            directory: MemoryDirectory::new(),
            config: EngineConfig::default(),
            devices: Vec::new(),
            queue: VecDeque::new(),
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Configuration for devices added from now on.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Shared directory.
    pub fn directory(&self) -> &MemoryDirectory {
        &self.directory
    }

    /// Fresh random pickle key.
    pub fn pickle_key(&self) -> PickleKey {
        use olmstead_core::Environment;
        PickleKey::new(self.env.random_array())
    }

    /// Add a device on a caller-provided store.
    ///
    /// The device publishes its keys and every device learns every other
    /// device's keys.
    pub async fn add_device_with_store(&mut self, user: &str, device: &str, store: S) -> Result<TestDevice<S>, EngineError> {
        let owner = DeviceKey::new(user, device);
        let engine = CryptoEngine::builder(owner, self.pickle_key(), store, self.directory.clone(), self.env.clone())
            .config(self.config.clone())
            .open()?;
        self.add_engine(engine).await
    }

    /// Add an already opened engine.
    pub async fn add_engine(&mut self, engine: SimEngine<S>) -> Result<TestDevice<S>, EngineError> {
        engine.publish_keys().await?;
        let device = TestDevice { key: engine.owner().clone(), engine: Arc::new(engine) };
        debug!(device = %device.key, "device joined");

        self.devices.retain(|existing| existing.key != device.key);
        self.devices.push(device.clone());
        self.sync_device_keys()?;
        Ok(device)
    }

    /// Remove a device; messages addressed to it are dropped from now on.
    pub fn remove_device(&mut self, device: &DeviceKey) {
        self.devices.retain(|existing| &existing.key != device);
    }

    /// Let every device download every other device's published keys.
    pub fn sync_device_keys(&self) -> Result<(), EngineError> {
        for device in &self.devices {
            for other in &self.devices {
                if other.key == device.key {
                    continue;
                }
                if let Some(keys) = self.directory.device_keys(&other.key) {
                    device.engine.receive_device_keys(&keys)?;
                }
            }
        }
        Ok(())
    }

    /// Look up a device by key.
    pub fn device(&self, key: &DeviceKey) -> Option<&TestDevice<S>> {
        self.devices.iter().find(|device| &device.key == key)
    }

    /// Every device of `user`.
    pub fn devices_of(&self, user: &str) -> Vec<DeviceKey> {
        let user = UserId::new(user);
        self.devices.iter().filter(|device| device.key.user_id == user).map(|device| device.key.clone()).collect()
    }

    /// Keys of every device.
    pub fn all_devices(&self) -> Vec<DeviceKey> {
        self.devices.iter().map(|device| device.key.clone()).collect()
    }

    /// Queue outgoing messages and record the remaining actions.
    pub fn route(&mut self, from: &DeviceKey, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::SendToDevice(message) => {
                    trace!(from = %from, to = %message.recipient, "queued to-device message");
                    self.queue.push_back(message);
                },
                other => self.events.push((from.clone(), other)),
            }
        }
    }

    /// Encrypt a room message from `sender` to `recipients` and queue the
    /// resulting key shares.
    pub async fn send_room_message(
        &mut self,
        sender: &TestDevice<S>,
        room: &str,
        recipients: &[DeviceKey],
        plaintext: &[u8],
    ) -> Result<EncryptedRoomMessage, EngineError> {
        let (message, actions) = sender.engine.encrypt_room_message(&RoomId::new(room), recipients, plaintext).await?;
        self.route(&sender.key, actions);
        Ok(message)
    }

    /// Deliver queued messages until the queue is empty, including messages
    /// produced while delivering. Returns how many were delivered.
    pub async fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(message) = self.queue.pop_front() {
            let Some(recipient) = self.device(&message.recipient).cloned() else {
                trace!(to = %message.recipient, "dropped message for unknown device");
                continue;
            };
            delivered += 1;
            match recipient.engine.receive_to_device(&message).await {
                Ok(actions) => self.route(&recipient.key, actions),
                Err(error) => {
                    debug!(device = %recipient.key, %error, "delivery failed");
                    self.errors.push((recipient.key, error));
                },
            }
        }
        delivered
    }

    /// Queued, undelivered messages.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Take the undelivered messages out of the queue.
    pub fn take_pending(&mut self) -> Vec<ToDeviceMessage> {
        self.queue.drain(..).collect()
    }

    /// Put a message at the back of the queue.
    pub fn inject(&mut self, message: ToDeviceMessage) {
        self.queue.push_back(message);
    }

    /// Recorded non-send actions, oldest first.
    pub fn events(&self) -> &[(DeviceKey, EngineAction)] {
        &self.events
    }

    /// Take the recorded non-send actions.
    pub fn take_events(&mut self) -> Vec<(DeviceKey, EngineAction)> {
        std::mem::take(&mut self.events)
    }

    /// Take the recorded delivery failures.
    pub fn take_errors(&mut self) -> Vec<(DeviceKey, EngineError)> {
        std::mem::take(&mut self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn devices_learn_each_other() {
        let mut world = World::new(1);
        let alice = world.add_device("@alice:hs", "A").await.unwrap();
        let bob = world.add_device("@bob:hs", "B").await.unwrap();

        assert!(alice.engine.device(&bob.key).unwrap().is_some());
        assert!(bob.engine.device(&alice.key).unwrap().is_some());
        assert!(world.directory().has_fallback_key(&bob.key));
        assert!(world.directory().one_time_key_count(&bob.key) > 0);
    }

    #[tokio::test]
    async fn room_message_round_trip() {
        let mut world = World::new(2);
        let alice = world.add_device("@alice:hs", "A").await.unwrap();
        let bob = world.add_device("@bob:hs", "B").await.unwrap();

        let message = world.send_room_message(&alice, "!room:hs", &[bob.key.clone()], b"hello").await.unwrap();
        assert_eq!(world.deliver_all().await, 1);

        let decrypted = bob.engine.decrypt_room_message(&message).await.unwrap();
        assert_eq!(decrypted.plaintext, b"hello");
        assert!(world.take_errors().is_empty());
    }

    #[tokio::test]
    async fn removed_device_receives_nothing() {
        let mut world = World::new(3);
        let alice = world.add_device("@alice:hs", "A").await.unwrap();
        let bob = world.add_device("@bob:hs", "B").await.unwrap();

        world.send_room_message(&alice, "!room:hs", &[bob.key.clone()], b"hi").await.unwrap();
        world.remove_device(&bob.key);

        assert_eq!(world.deliver_all().await, 0);
        assert_eq!(world.pending(), 0);
    }
}
