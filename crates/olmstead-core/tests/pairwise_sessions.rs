//! Pairwise channel scenarios: session selection, handshake fallbacks and
//! recovery from a desynchronized ratchet.

use olmstead_core::{
    DecryptionError, EngineAction, EngineError, MemoryStore, OlmError, Store, ToDeviceContent, ToDeviceMessage,
    storage::{Table, WriteOp},
    wire::{OlmContent, OlmEnvelope, StaleSessionNotice},
};
use olmstead_harness::{DirectoryOp, TestDevice, World};

async fn pair(seed: u64) -> (World, TestDevice, TestDevice) {
    let mut world = World::new(seed);
    let alice = world.add_device("@alice:hs", "A").await.unwrap();
    let bob = world.add_device("@bob:hs", "B").await.unwrap();
    (world, alice, bob)
}

fn encrypted(sender: &TestDevice, recipient: &TestDevice, envelope: OlmEnvelope) -> ToDeviceMessage {
    ToDeviceMessage {
        sender: sender.key.user_id.clone(),
        recipient: recipient.key.clone(),
        content: ToDeviceContent::Encrypted(envelope),
    }
}

async fn send_dummy(from: &TestDevice, to: &TestDevice) -> ToDeviceMessage {
    let identity = from.engine.device(&to.key).unwrap().unwrap();
    let envelope = from.engine.olm().encrypt_content(&identity, OlmContent::Dummy).await.unwrap();
    encrypted(from, to, envelope)
}

fn rows(store: &MemoryStore, table: Table) -> Vec<WriteOp> {
    store
        .scan_prefix(table, &[])
        .unwrap()
        .into_iter()
        .map(|(key, value)| WriteOp::Put { table, key, value })
        .collect()
}

#[tokio::test]
async fn first_message_opens_session_both_sides_agree() {
    let (mut world, alice, bob) = pair(1).await;

    let message = send_dummy(&alice, &bob).await;
    world.inject(message);
    world.deliver_all().await;
    assert!(world.take_errors().is_empty());

    let bob_at_alice = alice.engine.device(&bob.key).unwrap().unwrap();
    let alice_at_bob = bob.engine.device(&alice.key).unwrap().unwrap();
    let session = alice.engine.current_session_id(&bob_at_alice).unwrap();
    assert!(session.is_some());
    assert_eq!(session, bob.engine.current_session_id(&alice_at_bob).unwrap());
    assert_eq!(world.directory().claim_count(), 1);
}

#[tokio::test]
async fn most_recently_used_session_is_current() {
    let (mut world, alice, bob) = pair(2).await;
    let bob_at_alice = alice.engine.device(&bob.key).unwrap().unwrap();
    let alice_at_bob = bob.engine.device(&alice.key).unwrap().unwrap();

    // Both sides open a session before seeing the other's.
    let from_alice = send_dummy(&alice, &bob).await;
    let from_bob = send_dummy(&bob, &alice).await;
    let first = alice.engine.current_session_id(&bob_at_alice).unwrap().unwrap();
    let second = bob.engine.current_session_id(&alice_at_bob).unwrap().unwrap();
    assert_ne!(first, second);

    world.env().advance(std::time::Duration::from_secs(1));
    world.inject(from_alice);
    world.inject(from_bob);
    world.deliver_all().await;
    assert!(world.take_errors().is_empty());

    // Each side last used the session the other created.
    assert_eq!(alice.engine.current_session_id(&bob_at_alice).unwrap().unwrap(), second);
    assert_eq!(bob.engine.current_session_id(&alice_at_bob).unwrap().unwrap(), first);

    // Traffic keeps flowing over whichever session is current.
    let reply = send_dummy(&alice, &bob).await;
    world.inject(reply);
    world.deliver_all().await;
    assert!(world.take_errors().is_empty());
}

#[tokio::test]
async fn exhausted_one_time_keys_fall_back() {
    let (mut world, alice, bob) = pair(3).await;
    world.directory().exhaust_one_time_keys(&bob.key);

    let message = send_dummy(&alice, &bob).await;
    world.inject(message);
    world.deliver_all().await;

    assert!(world.take_errors().is_empty());
    assert!(world.directory().has_fallback_key(&bob.key));
}

#[tokio::test]
async fn transient_directory_failures_are_retried() {
    let (world, alice, bob) = pair(4).await;
    world.directory().fail_next(2);

    let identity = alice.engine.device(&bob.key).unwrap().unwrap();
    assert!(alice.engine.olm().encrypt_content(&identity, OlmContent::Dummy).await.is_ok());
    assert_eq!(world.directory().claim_count(), 1);
}

#[tokio::test]
async fn rejected_claim_is_a_handshake_failure() {
    let (world, alice, bob) = pair(5).await;
    world.directory().reject(DirectoryOp::Claim);

    let identity = alice.engine.device(&bob.key).unwrap().unwrap();
    let err = alice.engine.olm().encrypt_content(&identity, OlmContent::Dummy).await.unwrap_err();
    assert!(matches!(err, OlmError::Handshake(_)));
    assert!(err.is_no_olm());
}

#[tokio::test]
async fn message_for_another_identity_key_is_rejected() {
    let mut world = World::new(6);
    let alice = world.add_device("@alice:hs", "A").await.unwrap();
    let bob = world.add_device("@bob:hs", "B").await.unwrap();
    let carol = world.add_device("@carol:hs", "C").await.unwrap();

    let to_bob = send_dummy(&alice, &bob).await;
    let ToDeviceContent::Encrypted(envelope) = to_bob.content else { panic!("expected encrypted content") };

    let err = carol.engine.olm().decrypt_payload(&envelope).await.unwrap_err();
    assert!(matches!(err, OlmError::Decryption(DecryptionError::MalformedEnvelope { .. })));
}

#[tokio::test]
async fn envelope_body_travels_as_base64() {
    let (_world, alice, bob) = pair(10).await;
    let ToDeviceContent::Encrypted(envelope) = send_dummy(&alice, &bob).await.content else {
        panic!("expected encrypted content")
    };

    let json = serde_json::to_value(&envelope).unwrap();
    let body = json["body"].as_str().unwrap();
    assert!(!olmstead_crypto::encoding::decode(body).unwrap().is_empty());

    let mut garbled = envelope.clone();
    garbled.body = "not base64!".into();
    let err = bob.engine.olm().decrypt_payload(&garbled).await.unwrap_err();
    assert!(matches!(err, OlmError::Decryption(DecryptionError::MalformedEnvelope { .. })));

    // The garbled copy left the session untouched.
    assert!(bob.engine.olm().decrypt_payload(&envelope).await.is_ok());
    assert!(bob.engine.olm().wedged_devices().is_empty());
}

#[tokio::test]
async fn rolled_back_sender_is_unwedged_by_receiver() {
    let mut world = World::new(7);
    let alice_store = MemoryStore::new();
    let alice = world.add_device_with_store("@alice:hs", "A", alice_store.clone()).await.unwrap();
    let bob = world.add_device("@bob:hs", "B").await.unwrap();
    let bob_at_alice = alice.engine.device(&bob.key).unwrap().unwrap();
    let alice_at_bob = bob.engine.device(&alice.key).unwrap().unwrap();

    let msg1 = send_dummy(&alice, &bob).await;
    let snapshot = rows(&alice_store, Table::PairwiseSessions);
    let after_snapshot = send_dummy(&alice, &bob).await;
    world.inject(msg1);
    world.inject(after_snapshot);
    world.deliver_all().await;
    assert!(world.take_errors().is_empty());

    // Alice restores an old backup: her ratchet reuses a key Bob consumed.
    alice_store.write(snapshot).unwrap();
    let broken = alice.engine.current_session_id(&bob_at_alice).unwrap().unwrap();

    let msg2 = send_dummy(&alice, &bob).await;
    world.inject(msg2.clone());
    world.deliver_all().await;
    let errors = world.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0].1,
        EngineError::Olm(OlmError::Decryption(DecryptionError::IntegrityFailure { .. }))
    ));
    assert_eq!(bob.engine.olm().wedged_devices(), vec![alice.engine.identity_key().to_base64()]);

    // Bob opens a fresh session and tells Alice hers is stale.
    let repair = bob.engine.unwedge_devices().await.unwrap();
    assert_eq!(repair.len(), 2);
    assert!(bob.engine.olm().wedged_devices().is_empty());
    world.route(&bob.key, repair);
    world.deliver_all().await;
    assert!(world.take_errors().is_empty());

    let msg3 = send_dummy(&alice, &bob).await;
    let ToDeviceContent::Encrypted(envelope) = &msg3.content else { panic!("expected encrypted content") };
    assert_ne!(envelope.session_id, broken);
    // Alice reuses the session Bob opened instead of claiming another key.
    assert_eq!(world.directory().claim_count(), 2);
    assert_eq!(alice.engine.current_session_id(&bob_at_alice).unwrap(), bob.engine.current_session_id(&alice_at_bob).unwrap());
    world.inject(msg3);
    world.deliver_all().await;
    assert!(world.take_errors().is_empty());

    // The lost message stays lost.
    world.inject(msg2);
    world.deliver_all().await;
    assert_eq!(world.take_errors().len(), 1);
}

#[tokio::test]
async fn unwedging_is_rate_limited() {
    let (mut world, alice, bob) = pair(8).await;

    let msg = send_dummy(&alice, &bob).await;
    world.inject(msg.clone());
    world.deliver_all().await;

    // A replayed pre-key message fails on the session it created.
    world.inject(msg.clone());
    world.deliver_all().await;
    assert_eq!(world.take_errors().len(), 1);
    assert_eq!(bob.engine.unwedge_devices().await.unwrap().len(), 2);

    world.inject(msg);
    world.deliver_all().await;
    assert_eq!(world.take_errors().len(), 1);
    assert!(bob.engine.unwedge_devices().await.unwrap().is_empty());

    world.env().advance(std::time::Duration::from_secs(3601));
    let actions = bob.engine.unwedge_devices().await.unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions.iter().any(|action| matches!(
        action,
        EngineAction::SendToDevice(ToDeviceMessage { content: ToDeviceContent::SessionStale(_), .. })
    )));
}

#[tokio::test]
async fn stale_notice_for_foreign_session_is_ignored() {
    let (_world, alice, bob) = pair(9).await;

    let notice = StaleSessionNotice {
        sender_key: bob.engine.identity_key().to_base64(),
        session_id: "not-a-session".into(),
    };
    assert!(!alice.engine.olm().handle_stale_notice(&bob.key.user_id, &notice).unwrap());

    // Notices naming a key owned by another user are ignored too.
    let _ = send_dummy(&alice, &bob).await;
    let bob_at_alice = alice.engine.device(&bob.key).unwrap().unwrap();
    let session_id = alice.engine.current_session_id(&bob_at_alice).unwrap().unwrap();
    let spoofed = StaleSessionNotice { sender_key: notice.sender_key, session_id };
    assert!(!alice.engine.olm().handle_stale_notice(&alice.key.user_id, &spoofed).unwrap());
    assert!(alice.engine.olm().handle_stale_notice(&bob.key.user_id, &spoofed).unwrap());
}
