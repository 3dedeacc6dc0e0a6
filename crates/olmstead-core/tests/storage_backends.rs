//! Engine behaviour across storage backends and storage faults.

use olmstead_core::{
    ChaoticStore, CryptoEngine, DecryptionError, DeviceKey, EngineError, MemoryStore, PickleKey, RedbStore,
    wire::OlmContent,
};
use olmstead_harness::{SimEnv, World};

#[tokio::test]
async fn engine_state_survives_restart_on_redb() {
    let dir = tempfile::tempdir().unwrap();
    let alice_path = dir.path().join("alice.redb");
    let pickle_key = PickleKey::new([7; 32]);

    let mut world: World<RedbStore> = World::with_env(SimEnv::with_seed(70));
    let open_alice = |world: &World<RedbStore>| {
        CryptoEngine::builder(
            DeviceKey::new("@alice:hs", "A"),
            pickle_key.clone(),
            RedbStore::open(&alice_path).unwrap(),
            world.directory().clone(),
            world.env().clone(),
        )
        .open()
        .unwrap()
    };

    let alice = world.add_engine(open_alice(&world)).await.unwrap();
    let bob = world.add_device_with_store("@bob:hs", "B", RedbStore::open(dir.path().join("bob.redb")).unwrap()).await.unwrap();

    let first = world.send_room_message(&bob, "!room:hs", &[alice.key.clone()], b"before").await.unwrap();
    world.deliver_all().await;
    alice.engine.decrypt_room_message(&first).await.unwrap();
    let identity_key = alice.engine.identity_key();

    // Restart Alice.
    world.remove_device(&alice.key);
    drop(alice);
    let alice = world.add_engine(open_alice(&world)).await.unwrap();
    assert_eq!(alice.engine.identity_key(), identity_key);

    // Group session and replay markers persisted.
    let second = world.send_room_message(&bob, "!room:hs", &[alice.key.clone()], b"after").await.unwrap();
    assert_eq!(world.pending(), 0);
    assert_eq!(alice.engine.decrypt_room_message(&second).await.unwrap().plaintext, b"after");
    assert!(matches!(alice.engine.decrypt_room_message(&first).await, Err(DecryptionError::Replay { .. })));

    // Pairwise session persisted: replying needs no new handshake.
    let claims = world.directory().claim_count();
    let bob_identity = alice.engine.device(&bob.key).unwrap().unwrap();
    alice.engine.olm().encrypt_content(&bob_identity, OlmContent::Dummy).await.unwrap();
    assert_eq!(world.directory().claim_count(), claims);
}

#[tokio::test]
async fn wrong_pickle_key_cannot_open_account() {
    let store = MemoryStore::new();
    let env = SimEnv::with_seed(71);
    let directory = olmstead_harness::MemoryDirectory::new();
    let owner = DeviceKey::new("@alice:hs", "A");

    CryptoEngine::builder(owner.clone(), PickleKey::new([1; 32]), store.clone(), directory.clone(), env.clone())
        .open()
        .unwrap();
    let reopened = CryptoEngine::builder(owner, PickleKey::new([2; 32]), store, directory, env).open();

    assert!(matches!(reopened, Err(EngineError::Identity(_))));
}

#[tokio::test]
async fn failed_decrypts_leave_no_partial_state() {
    let mut world: World<ChaoticStore<MemoryStore>> = World::with_env(SimEnv::with_seed(72));
    let alice = world.add_device_with_store("@alice:hs", "A", ChaoticStore::with_seed(MemoryStore::new(), 0.0, 1)).await.unwrap();
    let bob_store = ChaoticStore::with_seed(MemoryStore::new(), 0.3, 42);
    bob_store.set_enabled(false);
    let bob = world.add_device_with_store("@bob:hs", "B", bob_store.clone()).await.unwrap();

    let mut messages = Vec::new();
    for i in 0..20u8 {
        messages.push(world.send_room_message(&alice, "!room:hs", &[bob.key.clone()], &[i]).await.unwrap());
    }
    world.deliver_all().await;
    assert!(world.take_errors().is_empty());

    bob_store.set_enabled(true);
    let mut failed = Vec::new();
    for message in &messages {
        match bob.engine.decrypt_room_message(message).await {
            Ok(decrypted) => assert_eq!(decrypted.plaintext, vec![message.message_index as u8]),
            Err(DecryptionError::Store(_)) => failed.push(message),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    bob_store.set_enabled(false);
    assert!(bob_store.injected_failures() > 0);

    // Every failed decrypt can be retried; every successful one is now a replay.
    for message in &messages {
        let result = bob.engine.decrypt_room_message(message).await;
        if failed.contains(&message) {
            assert_eq!(result.unwrap().plaintext, vec![message.message_index as u8]);
        } else {
            assert!(matches!(result, Err(DecryptionError::Replay { .. })));
        }
    }
}
