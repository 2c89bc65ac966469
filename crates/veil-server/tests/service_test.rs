//! Routing service behavior: registration, group membership fanout,
//! message routing, and mailbox semantics.

use veil_proto::{
    GroupType, IdentityId, MessageEnvelope, ServerEvent,
};
use veil_server::{ChatService, IdentityRecord, ServiceConfig, ServiceError};

fn record(tag: u8) -> IdentityRecord {
    IdentityRecord { identity_key: vec![tag; 32], registration_id: u32::from(tag) }
}

fn service_with_users(users: &[&str]) -> ChatService {
    let service = ChatService::new();
    for (n, user) in users.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        service.register_user(&IdentityId::new(*user), record(n as u8 + 1));
    }
    service
}

fn envelope(sender: &str, recipient: &str, payload: &[u8]) -> MessageEnvelope {
    MessageEnvelope::new(IdentityId::new(sender), recipient, payload.to_vec())
}

#[test]
fn group_membership_tracks_additions_and_removals() {
    let service = service_with_users(&["alice", "bob", "carol"]);
    let alice = IdentityId::new("alice");
    let bob = IdentityId::new("bob");
    let carol = IdentityId::new("carol");

    let group_id = service.create_group(&alice, GroupType::ServerSide).expect("create");
    service.invite_member(&group_id, &alice, &bob, None, None).expect("invite bob");
    service.invite_member(&group_id, &alice, &carol, None, None).expect("invite carol");

    assert_eq!(
        service.group(&group_id).expect("group").participants,
        vec![alice.clone(), bob.clone(), carol.clone()]
    );

    service.remove_member(&group_id, &bob).expect("remove bob");
    assert_eq!(service.group(&group_id).expect("group").participants, vec![alice, carol]);
}

#[test]
fn create_group_requires_registered_initiator() {
    let service = ChatService::new();
    assert!(matches!(
        service.create_group(&IdentityId::new("ghost"), GroupType::Mls),
        Err(ServiceError::NotFound { .. })
    ));
}

#[tokio::test]
async fn invitation_goes_to_invitee_and_addition_to_the_rest() {
    let service = service_with_users(&["alice", "bob", "carol"]);
    let alice = IdentityId::new("alice");
    let bob = IdentityId::new("bob");
    let carol = IdentityId::new("carol");

    let group_id = service.create_group(&alice, GroupType::ClientSide).expect("create");
    service.invite_member(&group_id, &alice, &bob, None, None).expect("invite bob");
    service
        .invite_member(&group_id, &alice, &carol, Some(vec![0xA0]), Some(vec![0xB0]))
        .expect("invite carol");

    let mut carol_events = service.subscribe_events(&carol).expect("subscribe");
    match carol_events.recv().await.expect("event") {
        ServerEvent::GroupInvitation { group, inviter, piggyback } => {
            assert_eq!(group.group_id, group_id);
            assert_eq!(group.participants, vec![alice.clone(), bob.clone(), carol.clone()]);
            assert_eq!(inviter, alice);
            assert_eq!(piggyback, Some(vec![0xA0]));
        },
        other => panic!("expected invitation, got {other:?}"),
    }

    let mut bob_events = service.subscribe_events(&bob).expect("subscribe");
    // Bob's first event is his own invitation; the second is carol's addition.
    assert!(matches!(bob_events.recv().await.expect("event"), ServerEvent::GroupInvitation { .. }));
    match bob_events.recv().await.expect("event") {
        ServerEvent::GroupAddition { group_id: event_group, added, piggyback } => {
            assert_eq!(event_group, group_id);
            assert_eq!(added, carol);
            assert_eq!(piggyback, Some(vec![0xB0]));
        },
        other => panic!("expected addition, got {other:?}"),
    }
}

#[tokio::test]
async fn removal_reaches_remaining_members_and_the_removed() {
    let service = service_with_users(&["alice", "bob"]);
    let alice = IdentityId::new("alice");
    let bob = IdentityId::new("bob");

    let group_id = service.create_group(&alice, GroupType::ServerSide).expect("create");
    service.invite_member(&group_id, &alice, &bob, None, None).expect("invite");
    service.remove_member(&group_id, &bob).expect("remove");

    let mut bob_events = service.subscribe_events(&bob).expect("subscribe");
    assert!(matches!(bob_events.recv().await.expect("event"), ServerEvent::GroupInvitation { .. }));
    match bob_events.recv().await.expect("event") {
        ServerEvent::GroupRemoval { removed, .. } => assert_eq!(removed, bob),
        other => panic!("expected removal, got {other:?}"),
    }

    let mut alice_events = service.subscribe_events(&alice).expect("subscribe");
    // Skip the addition for bob's invite.
    assert!(matches!(alice_events.recv().await.expect("event"), ServerEvent::GroupAddition { .. }));
    assert!(matches!(
        alice_events.recv().await.expect("event"),
        ServerEvent::GroupRemoval { .. }
    ));
}

#[test]
fn pseudonymous_chatbot_requires_the_external_path() {
    let service = service_with_users(&["alice"]);
    let alice = IdentityId::new("alice");
    let bot = IdentityId::new("weatherbot");
    service.register_chatbot(&bot, record(9));

    let group_id = service.create_group(&alice, GroupType::ServerSide).expect("create");
    let result = service.invite_chatbot(&group_id, &bot, false, true, None, None);
    assert!(matches!(result, Err(ServiceError::Configuration(_))));

    // Rejected before any mutation: the group has no chatbots.
    assert!(service.group(&group_id).expect("group").chatbots.is_empty());
}

#[tokio::test]
async fn external_path_chatbot_does_not_see_participants() {
    let service = service_with_users(&["alice", "bob"]);
    let alice = IdentityId::new("alice");
    let bob = IdentityId::new("bob");
    let bot = IdentityId::new("weatherbot");
    service.register_chatbot(&bot, record(9));

    let group_id = service.create_group(&alice, GroupType::ServerSide).expect("create");
    service.invite_member(&group_id, &alice, &bob, None, None).expect("invite");
    service
        .invite_chatbot(&group_id, &bot, true, false, Some(vec![0xC0]), None)
        .expect("invite chatbot");

    let mut bot_events = service.subscribe_events(&bot).expect("subscribe");
    match bot_events.recv().await.expect("event") {
        ServerEvent::ChatbotInvitation { group, visibility, piggyback } => {
            assert!(group.participants.is_empty());
            assert!(visibility.is_iga());
            assert_eq!(piggyback, Some(vec![0xC0]));
        },
        other => panic!("expected chatbot invitation, got {other:?}"),
    }

    // Participants still learn about the chatbot.
    let mut bob_events = service.subscribe_events(&bob).expect("subscribe");
    assert!(matches!(bob_events.recv().await.expect("event"), ServerEvent::GroupInvitation { .. }));
    assert!(matches!(
        bob_events.recv().await.expect("event"),
        ServerEvent::ChatbotAddition { .. }
    ));
}

#[tokio::test]
async fn tree_group_chatbots_learn_about_each_other() {
    let service = service_with_users(&["alice"]);
    let alice = IdentityId::new("alice");
    let first = IdentityId::new("weatherbot");
    let second = IdentityId::new("newsbot");
    service.register_chatbot(&first, record(8));
    service.register_chatbot(&second, record(9));

    let group_id = service.create_group(&alice, GroupType::Mls).expect("create");
    service.invite_chatbot(&group_id, &first, true, false, None, None).expect("invite first");
    service.invite_chatbot(&group_id, &second, true, false, None, None).expect("invite second");

    let mut first_events = service.subscribe_events(&first).expect("subscribe");
    assert!(matches!(
        first_events.recv().await.expect("event"),
        ServerEvent::ChatbotInvitation { .. }
    ));
    match first_events.recv().await.expect("event") {
        ServerEvent::ChatbotAddition { chatbot, .. } => assert_eq!(chatbot, second),
        other => panic!("expected chatbot addition, got {other:?}"),
    }
}

#[tokio::test]
async fn mailbox_preserves_envelope_order() {
    let service = service_with_users(&["alice", "bob"]);
    let bob = IdentityId::new("bob");

    for n in 0..10u8 {
        service.send_message(envelope("alice", "bob", &[n])).expect("send");
    }

    let mut messages = service.subscribe_messages(&bob).expect("subscribe");
    for n in 0..10u8 {
        assert_eq!(messages.recv().await.expect("recv").ciphertext, vec![n]);
    }
}

#[test]
fn unregistered_recipient_is_rejected() {
    let service = service_with_users(&["alice"]);
    assert!(matches!(
        service.send_message(envelope("alice", "nobody", b"hi")),
        Err(ServiceError::NotFound { .. })
    ));
}

#[test]
fn full_mailbox_rejects_the_send() {
    let service = ChatService::with_config(ServiceConfig { mailbox_capacity: 2 });
    service.register_user(&IdentityId::new("alice"), record(1));
    service.register_user(&IdentityId::new("bob"), record(2));

    service.send_message(envelope("alice", "bob", &[1])).expect("send");
    service.send_message(envelope("alice", "bob", &[2])).expect("send");
    assert!(matches!(
        service.send_message(envelope("alice", "bob", &[3])),
        Err(ServiceError::MailboxFull { .. })
    ));
}

#[tokio::test]
async fn group_send_strips_chatbot_submessages_for_members() {
    let service = service_with_users(&["alice", "bob"]);
    let alice = IdentityId::new("alice");
    let bob = IdentityId::new("bob");
    let bot = IdentityId::new("weatherbot");
    service.register_chatbot(&bot, record(9));

    let group_id = service.create_group(&alice, GroupType::ServerSide).expect("create");
    service.invite_member(&group_id, &alice, &bob, None, None).expect("invite");
    service.invite_chatbot(&group_id, &bot, true, false, None, None).expect("invite chatbot");

    let mut message = envelope("alice", group_id.as_str(), b"group ciphertext");
    message.is_iga = true;
    message.chatbot_messages.insert(bot.clone(), b"bot ciphertext".to_vec());
    service.send_message(message).expect("send");

    let mut bob_messages = service.subscribe_messages(&bob).expect("subscribe");
    let received = bob_messages.recv().await.expect("recv");
    assert_eq!(received.ciphertext, b"group ciphertext");
    assert!(received.chatbot_messages.is_empty());

    let mut bot_messages = service.subscribe_messages(&bot).expect("subscribe");
    let sub = bot_messages.recv().await.expect("recv");
    assert_eq!(sub.ciphertext, b"bot ciphertext");
    assert_eq!(sub.sender, alice);
    assert!(sub.is_iga);
}

#[test]
fn bad_chatbot_target_rejects_the_whole_send() {
    let service = service_with_users(&["alice", "bob"]);
    let alice = IdentityId::new("alice");
    let bob = IdentityId::new("bob");

    let group_id = service.create_group(&alice, GroupType::ServerSide).expect("create");
    service.invite_member(&group_id, &alice, &bob, None, None).expect("invite");

    // "newsbot" is registered but not in the group.
    let stranger = IdentityId::new("newsbot");
    service.register_chatbot(&stranger, record(9));

    let mut message = envelope("alice", group_id.as_str(), b"ct");
    message.chatbot_messages.insert(stranger, b"sub".to_vec());
    assert!(matches!(service.send_message(message), Err(ServiceError::NotFound { .. })));

    // Nothing was delivered to bob.
    let mut bob_messages = service.subscribe_messages(&bob).expect("subscribe");
    assert!(bob_messages.try_recv().is_err());
}

#[test]
fn one_time_prekeys_are_consumed_through_the_service() {
    let service = service_with_users(&["alice"]);
    let alice = IdentityId::new("alice");

    service.upload_pre_key(&alice, 1, vec![0xAA]).expect("upload");
    assert_eq!(service.fetch_pre_key(&alice).expect("fetch"), Some((1, vec![0xAA])));
    assert_eq!(service.fetch_pre_key(&alice).expect("fetch"), None);
}

#[test]
fn key_packages_are_consumed_through_the_service() {
    let service = service_with_users(&["alice"]);
    let alice = IdentityId::new("alice");

    service.upload_key_package(&alice, vec![0xC4]).expect("upload");
    assert_eq!(service.fetch_key_package(&alice).expect("fetch"), vec![0xC4]);
    assert!(matches!(
        service.fetch_key_package(&alice),
        Err(ServiceError::NotFound { .. })
    ));
}
