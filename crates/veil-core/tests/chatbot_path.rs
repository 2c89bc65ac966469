//! End-to-end chatbot path: a tree-based group with a chatbot on the
//! independent key-agreement channel.
//!
//! Exercises the full composition the messaging layer performs: group
//! commits re-key the external tree, tree updates reach the chatbot, and
//! payloads sealed under the shared root cross the boundary in both
//! directions.

use veil_core::{ExternalTree, MlsSession, Processed};
use veil_crypto::{SealedMessage, open, seal};
use veil_proto::{GroupId, GroupPlaintext, IdentityId, MessageKind};

fn text(payload: &[u8], chatbot_ids: Vec<IdentityId>) -> GroupPlaintext {
    GroupPlaintext { payload: payload.to_vec(), kind: MessageKind::Text, chatbot_ids }
}

fn bot() -> IdentityId {
    IdentityId::new("weatherbot")
}

/// Two members, one external chatbot, trees in sync.
fn setup() -> (MlsSession, MlsSession, ExternalTree) {
    let group_id = GroupId::new("groupDDDD0001");
    let alice = IdentityId::new("alice");
    let bob = IdentityId::new("bob");

    let mut alice_session = MlsSession::create(group_id.clone(), alice).expect("create");
    let (bob_kp, bob_pending) = MlsSession::generate_key_package(&bob).expect("key package");
    let (welcome, _commit) = alice_session.add_member(&bob_kp).expect("add bob");
    let mut bob_session =
        MlsSession::join_from_welcome(group_id, bob, &welcome, bob_pending).expect("join");

    alice_session.init_multi_tree().expect("init tree");
    bob_session.init_multi_tree().expect("init tree");

    let (join, announcement) =
        alice_session.multi_tree_mut().expect("tree").external_node_join(&bot());
    bob_session
        .multi_tree_mut()
        .expect("tree")
        .add_external_node(&bot(), &announcement)
        .expect("add node");

    let chatbot = ExternalTree::new(&join);
    (alice_session, bob_session, chatbot)
}

#[test]
fn members_and_chatbot_agree_on_root() {
    let (alice, bob, chatbot) = setup();

    assert_eq!(alice.multi_tree().expect("tree").root_secret(&bot()), Some(chatbot.root_secret()));
    assert_eq!(bob.multi_tree().expect("tree").root_secret(&bot()), Some(chatbot.root_secret()));
}

#[test]
fn commit_rekeys_tree_and_update_reaches_chatbot() {
    let (mut alice, mut bob, mut chatbot) = setup();

    // A send advances the epoch; both members re-derive the tree secret
    // from the new epoch and rotate the chatbot root.
    let (message, commit) = alice.encrypt(&text(b"forecast please", vec![bot()])).expect("encrypt");
    let update = alice.multi_tree_mut().expect("tree").update(&[bot()]);

    assert!(matches!(bob.process(&message).expect("message"), Processed::Message { .. }));
    assert_eq!(bob.process(&commit).expect("commit"), Processed::EpochAdvanced);
    bob.multi_tree_mut().expect("tree").handle_update(&[bot()]);

    let ciphertext = update.ciphertexts.get(&bot()).expect("update for node");
    chatbot
        .handle_tree_update(ciphertext, update.new_root_public, update.new_root_sign_public)
        .expect("chatbot follows");

    let root = alice.multi_tree().expect("tree").root_secret(&bot());
    assert_eq!(root, bob.multi_tree().expect("tree").root_secret(&bot()));
    assert_eq!(root, Some(chatbot.root_secret()));
}

#[test]
fn sealed_payloads_cross_the_boundary_both_ways() {
    let (alice, _bob, chatbot) = setup();

    let root = alice.multi_tree().expect("tree").root_secret(&bot()).expect("root");

    // Member to chatbot, unsigned (visible sender travels in metadata).
    let sealed = seal(b"what's the weather", &root, [3u8; 12], None).expect("seal");
    let bytes = sealed.to_bytes().expect("serialize");
    let received = SealedMessage::from_bytes(&bytes).expect("parse");
    assert_eq!(
        open(&received, &chatbot.root_secret(), None).expect("open"),
        b"what's the weather"
    );

    // Chatbot to members, signed with the shared root's signing key so
    // members can attribute the reply to the tree.
    let reply =
        seal(b"sunny, 21C", &chatbot.root_secret(), [4u8; 12], Some(chatbot.root_signing()))
            .expect("seal reply");
    let verifier = alice
        .multi_tree()
        .expect("tree")
        .root_signing(&bot())
        .expect("root signing")
        .verifying_key();
    assert_eq!(open(&reply, &root, Some(&verifier)).expect("open reply"), b"sunny, 21C");
}

#[test]
fn chatbot_rotation_survives_group_rekey() {
    let (mut alice, mut bob, mut chatbot) = setup();

    let node_update = chatbot.update();
    alice
        .multi_tree_mut()
        .expect("tree")
        .handle_external_node_update(&bot(), &node_update)
        .expect("alice follows");
    bob.multi_tree_mut()
        .expect("tree")
        .handle_external_node_update(&bot(), &node_update)
        .expect("bob follows");

    assert_eq!(
        alice.multi_tree().expect("tree").root_secret(&bot()),
        Some(chatbot.root_secret())
    );

    // A group re-key afterwards still reaches the rotated node.
    let (message, commit) = alice.encrypt(&text(b"next", vec![bot()])).expect("encrypt");
    let update = alice.multi_tree_mut().expect("tree").update(&[bot()]);
    bob.process(&message).expect("message");
    bob.process(&commit).expect("commit");
    bob.multi_tree_mut().expect("tree").handle_update(&[bot()]);

    let ciphertext = update.ciphertexts.get(&bot()).expect("update for node");
    chatbot
        .handle_tree_update(ciphertext, update.new_root_public, update.new_root_sign_public)
        .expect("chatbot follows rekey");

    assert_eq!(
        bob.multi_tree().expect("tree").root_secret(&bot()),
        Some(chatbot.root_secret())
    );
}
