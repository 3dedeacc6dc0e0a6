//! Passphrase-protected room key export between devices.

use olmstead_core::{EngineConfig, EngineError, GroupError, ImportSummary};
use olmstead_crypto::KeyExportError;
use olmstead_harness::World;

fn fast_export() -> EngineConfig {
    EngineConfig { export_rounds: 1_000, ..EngineConfig::default() }
}

#[tokio::test]
async fn exported_keys_decrypt_on_another_device() {
    let mut world = World::new(60).with_config(fast_export());
    let alice = world.add_device("@alice:hs", "A").await.unwrap();
    let bob = world.add_device("@bob:hs", "B").await.unwrap();

    let first = world.send_room_message(&bob, "!one:hs", &[alice.key.clone()], b"one").await.unwrap();
    let second = world.send_room_message(&bob, "!two:hs", &[alice.key.clone()], b"two").await.unwrap();
    world.deliver_all().await;

    let armored = alice.engine.export_room_keys("correct horse").unwrap();
    assert!(armored.starts_with("-----BEGIN MEGOLM SESSION DATA-----"));

    let fresh = world.add_device("@alice:hs", "FRESH").await.unwrap();
    let summary = fresh.engine.import_room_keys(&armored, "correct horse").await.unwrap();
    assert_eq!(summary, ImportSummary { imported: 2, skipped: 0, invalid: 0 });

    for (message, text) in [(&first, b"one".as_slice()), (&second, b"two".as_slice())] {
        let decrypted = fresh.engine.decrypt_room_message(message).await.unwrap();
        assert_eq!(decrypted.plaintext, text);
        assert!(decrypted.forwarded);
    }

    // Importing again never replaces what we hold.
    let again = fresh.engine.import_room_keys(&armored, "correct horse").await.unwrap();
    assert_eq!(again, ImportSummary { imported: 0, skipped: 2, invalid: 0 });
}

#[tokio::test]
async fn wrong_passphrase_is_detected() {
    let mut world = World::new(61).with_config(fast_export());
    let alice = world.add_device("@alice:hs", "A").await.unwrap();
    let bob = world.add_device("@bob:hs", "B").await.unwrap();

    world.send_room_message(&bob, "!room:hs", &[alice.key.clone()], b"x").await.unwrap();
    world.deliver_all().await;
    let armored = alice.engine.export_room_keys("right").unwrap();

    let err = bob.engine.import_room_keys(&armored, "wrong").await.unwrap_err();
    assert_eq!(err, EngineError::Group(GroupError::KeyExport(KeyExportError::BadPassphrase)));
}

#[tokio::test]
async fn import_keeps_better_existing_session() {
    let mut world = World::new(62).with_config(fast_export());
    let alice = world.add_device("@alice:hs", "A").await.unwrap();
    let bob = world.add_device("@bob:hs", "B").await.unwrap();
    let carol = world.add_device("@carol:hs", "C").await.unwrap();

    // Carol joins after the first message, so her copy starts at index 1.
    let early = world.send_room_message(&bob, "!room:hs", &[alice.key.clone()], b"early").await.unwrap();
    world.send_room_message(&bob, "!room:hs", &[alice.key.clone(), carol.key.clone()], b"late").await.unwrap();
    world.deliver_all().await;

    let from_carol = carol.engine.export_room_keys("pw").unwrap();
    let summary = alice.engine.import_room_keys(&from_carol, "pw").await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(alice.engine.decrypt_room_message(&early).await.unwrap().plaintext, b"early");

    let from_alice = alice.engine.export_room_keys("pw").unwrap();
    let summary = carol.engine.import_room_keys(&from_alice, "pw").await.unwrap();
    assert_eq!(summary.imported, 1);
    assert_eq!(carol.engine.decrypt_room_message(&early).await.unwrap().plaintext, b"early");
}
