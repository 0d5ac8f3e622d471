//! Integration tests for the mail crate
//!
//! These tests run real mail servers on loopback listeners and verify the
//! complete flow from publishing to syncing, plus scripted fake servers
//! for the streamed download framing.

use chrono::Utc;
use mail::envelope::Header;
use mail::models::{Mail, Subscription, User, components};
use mail::router::{LookupRouter, Router, Tracker, TrackerRouter};
use mail::server::{MailServer, Server};
use mail::storage::{InMemoryMailStore, MailStore, SqliteMailStore};
use mail::transport::{self, RawMessage};
use mail::wire::{self, Data, Response, ResponseMessage, WireType};
use mail::{Address, Client, Error, ErrorKind, FeedOptions, Identity, LocalRouter};
use serde::Serialize;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

/// A mail server running on a background thread
struct TestServer {
    location: String,
    key: Arc<Identity>,
    store: Arc<dyn MailStore>,
}

impl TestServer {
    fn spawn() -> Self {
        Self::spawn_with_store(Arc::new(InMemoryMailStore::new()))
    }

    fn spawn_with_store(store: Arc<dyn MailStore>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let location = listener.local_addr().unwrap().to_string();
        let key = Arc::new(Identity::create().with_location(location.clone()));

        let handler = Arc::new(MailServer::new(store.clone(), key.clone(), location.clone()));
        let server = Server::new(location.clone(), key.clone(), handler);
        thread::spawn(move || server.serve(listener));

        Self {
            location,
            key,
            store,
        }
    }

    /// A new identity homed on this server, registered under `name`
    fn user(&self, name: &str) -> (Arc<Identity>, Client) {
        let key = Arc::new(Identity::create().with_location(self.location.clone()));
        let client = Client::new(key.clone(), self.key.address.clone());
        client.register([("name", name), ("avatar", "")]).unwrap();
        (key, client)
    }
}

fn note(author: &Identity, body: &str) -> Mail {
    Mail::builder(author.address.clone())
        .component(components::BODY, body)
        .build()
}

/// Fake server that answers one connection with a scripted reply sequence
fn spawn_fake_server<F>(script: F) -> (Address, mpsc::Receiver<usize>)
where
    F: FnOnce(&Identity, &Address, &mut TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let location = listener.local_addr().unwrap().to_string();
    let key = Identity::create().with_location(location);
    let address = key.address.clone();
    let (done_tx, done_rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let request = transport::receive(&mut conn, &key).unwrap();
        let mut requester = request.header.from.clone();
        requester.encryption_key = request.header.encryption_key;

        script(&key, &requester, &mut conn);

        // Count any bytes the client sends after the script finished
        let mut rest = Vec::new();
        let _ = std::io::Read::read_to_end(&mut conn, &mut rest);
        done_tx.send(rest.len()).unwrap();
    });

    (address, done_rx)
}

fn send<T: Serialize>(key: &Identity, to: &Address, conn: &mut TcpStream, kind: WireType, body: &T) {
    let message = RawMessage::new(Header::new(&key.address, to), kind, body).unwrap();
    transport::sign_and_send(message, key, Some(to), conn).unwrap();
}

fn response_message(i: usize) -> ResponseMessage {
    ResponseMessage {
        name: format!("m{i}"),
        from: "author".to_string(),
        to: "reader".to_string(),
        timestamp: i as i64,
        data: vec![],
    }
}

#[test]
fn test_publish_then_retrieve_round_trip() {
    let server = TestServer::spawn();
    let (alice, client) = server.user("Alice");
    let reader = Identity::create();

    let router = LocalRouter::new();
    router.insert("alice@test", alice.address.clone());

    let mail = Mail::builder(alice.address.clone())
        .component(components::BODY, "hello federation")
        .component("app/attachment", vec![0u8, 1, 2, 3])
        .build();
    let name = client.publish_message(&mail, &[], "", false).unwrap();

    let fetched = mail::download_message(&router, &name, &reader, "alice@test", None).unwrap();
    assert_eq!(fetched.components, mail.components);
    assert_eq!(fetched.author, alice.address);
}

#[test]
fn test_publish_without_name_is_content_addressed() {
    let server = TestServer::spawn();
    let (alice, client) = server.user("Alice");

    let mail = note(&alice, "same bytes");
    let first = client.publish_message(&mail, &[], "", false).unwrap();
    let second = client.publish_message(&mail, &[], "", false).unwrap();

    assert_eq!(first, second);
    assert_eq!(
        server.store.messages_with_name(&first, alice.fingerprint()).unwrap().len(),
        1
    );
}

#[test]
fn test_publish_unregistered_surfaces_remote_error() {
    let server = TestServer::spawn();
    let stranger = Arc::new(Identity::create());
    let client = Client::new(stranger.clone(), server.key.address.clone());

    let err = client
        .publish_message(&note(&stranger, "hi"), &[], "", false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(matches!(err, Error::Remote { code, .. } if code == wire::codes::NOT_REGISTERED));
}

#[test]
fn test_update_replaces_content() {
    let server = TestServer::spawn();
    let (alice, client) = server.user("Alice");
    let reader = Identity::create();
    let router = LocalRouter::new();
    router.insert("alice@test", alice.address.clone());

    client
        .publish_message(&note(&alice, "draft"), &[], "status", false)
        .unwrap();
    client
        .update_message(&note(&alice, "final"), &[], "status")
        .unwrap();

    let fetched = mail::download_message(&router, "status", &reader, "alice@test", None).unwrap();
    assert_eq!(fetched.component(components::BODY), Some(&b"final"[..]));
}

#[test]
fn test_update_with_empty_name_needs_no_server() {
    let key = Arc::new(Identity::create());
    let client = Client::new(key.clone(), Address::public().with_location("127.0.0.1:1"));
    let err = client.update_message(&note(&key, "x"), &[], "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
}

#[test]
fn test_download_zero_messages_reads_nothing_more() {
    let (server, done) = spawn_fake_server(|key, to, conn| {
        send(key, to, conn, WireType::Response, &Response::with_length(0));
        // Would desynchronize a client that kept reading
        send(key, to, conn, WireType::ResponseMessage, &response_message(1));
    });

    let key = Arc::new(Identity::create());
    let client = Client::new(key, server);
    let messages = client.download_messages(0, false).unwrap();
    assert!(messages.is_empty());

    drop(client);
    assert_eq!(done.recv().unwrap(), 0);
}

#[test]
fn test_download_mismatch_mid_stream_fails_whole_call() {
    let (server, _done) = spawn_fake_server(|key, to, conn| {
        send(key, to, conn, WireType::Response, &Response::with_length(5));
        for i in 1..=5 {
            if i == 3 {
                let data = Data {
                    key: "oops".to_string(),
                    data: vec![],
                };
                send(key, to, conn, WireType::Data, &data);
            } else {
                send(key, to, conn, WireType::ResponseMessage, &response_message(i));
            }
        }
    });

    let client = Client::new(Arc::new(Identity::create()), server);
    let err = client.download_messages(0, false).unwrap_err();
    assert!(matches!(
        err,
        Error::UnexpectedType {
            expected: WireType::ResponseMessage,
            found: WireType::Data
        }
    ));
}

#[test]
fn test_download_streams_incoming_mail() {
    let server = TestServer::spawn();
    let (alice, alice_client) = server.user("Alice");
    let (bob, bob_client) = server.user("Bob");

    let mut mail = note(&alice, "for bob only");
    mail.recipient = Some(bob.address.clone());
    alice_client
        .publish_message(&mail, &[bob.address.clone()], "", true)
        .unwrap();
    alice_client
        .publish_message(&note(&alice, "broadcast"), &[], "", false)
        .unwrap();

    let messages = bob_client.download_messages(0, false).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from, alice.fingerprint());
    assert_eq!(messages[0].to, bob.fingerprint());

    let opened = messages[0].to_mail(&bob).unwrap();
    assert_eq!(opened.component(components::BODY), Some(&b"for bob only"[..]));
    assert!(matches!(messages[0].to_mail(&alice), Err(Error::Verification(_))));
}

#[test]
fn test_data_round_trip() {
    let server = TestServer::spawn();
    let (_alice, client) = server.user("Alice");

    client.set_data("settings", b"{\"theme\":\"dark\"}").unwrap();
    assert_eq!(client.get_data("settings").unwrap(), b"{\"theme\":\"dark\"}");

    let err = client.get_data("missing").unwrap_err();
    assert!(matches!(err, Error::Remote { code, .. } if code == wire::codes::NOT_FOUND));
}

#[test]
fn test_profile_retrieval() {
    let server = TestServer::spawn();
    let (alice, _client) = server.user("Alice");
    let reader = Identity::create();
    let router = LocalRouter::new();
    router.insert("alice@test", alice.address.clone());

    let profile = mail::get_profile(&router, &reader, "alice@test").unwrap();
    assert_eq!(profile.components.len(), 2);
    assert_eq!(profile.component(components::PROFILE_NAME), Some(&b"Alice"[..]));
    assert!(profile.component(components::PROFILE_AVATAR).is_some());
    assert_eq!(profile.recipient, Some(reader.address.clone()));
}

#[test]
fn test_public_subscription_feed() {
    let alice_server = TestServer::spawn();
    let bob_server = TestServer::spawn();
    let (alice, _) = alice_server.user("Alice");
    let (bob, bob_client) = bob_server.user("Bob");

    let router = LocalRouter::new();
    router.insert("bob@b.test", bob.address.clone());

    let app_store = InMemoryMailStore::new();
    let user_id = app_store.insert_user(User::new("Alice", "")).unwrap();
    app_store
        .insert_subscription(Subscription::new(user_id, "bob@b.test"))
        .unwrap();
    let user = app_store.get_user(user_id).unwrap().unwrap();

    let t = Utc::now().timestamp();
    let m1 = note(&bob, "first public post");
    bob_client.publish_message(&m1, &[], "m1", false).unwrap();

    let options = FeedOptions {
        include_public: true,
        since: t - 1,
        ..FeedOptions::default()
    };
    let feed = mail::messages(&router, &app_store, &alice, &user, options).unwrap();

    assert_eq!(feed.len(), 1);
    assert!(feed[0].public);
    assert_eq!(feed[0].name, "m1");
    assert_eq!(feed[0].mail.components, m1.components);
    assert_eq!(feed[0].mail.author, bob.address);
}

#[test]
fn test_private_alert_feed() {
    let alice_server = TestServer::spawn();
    let bob_server = TestServer::spawn();
    let (alice, _) = alice_server.user("Alice");
    let (bob, bob_client) = bob_server.user("Bob");

    let router = LocalRouter::new();
    router.insert("alice@a.test", alice.address.clone());
    router.insert("bob@b.test", bob.address.clone());

    let mut secret = note(&bob, "just for alice");
    secret.recipient = Some(alice.address.clone());
    let name = bob_client
        .publish_message(&secret, &[alice.address.clone()], "", true)
        .unwrap();
    mail::send_alert(&router, &name, &bob, "alice@a.test", &bob_server.location).unwrap();

    let user = alice_server
        .store
        .user_for_fingerprint(alice.fingerprint())
        .unwrap()
        .unwrap();
    let options = FeedOptions {
        include_private: true,
        since: Utc::now().timestamp() - 60,
        ..FeedOptions::default()
    };
    let feed = mail::messages(&router, alice_server.store.as_ref(), &alice, &user, options).unwrap();

    assert_eq!(feed.len(), 1);
    assert!(!feed[0].public);
    assert_eq!(feed[0].name, name);
    assert_eq!(feed[0].mail.component(components::BODY), Some(&b"just for alice"[..]));
}

#[test]
fn test_alert_for_unknown_recipient_is_rejected() {
    let alice_server = TestServer::spawn();
    let bob_server = TestServer::spawn();
    let (bob, _) = bob_server.user("Bob");

    // Homed on alice_server but never registered there
    let ghost = Identity::create().with_location(alice_server.location.clone());
    let router = LocalRouter::new();
    router.insert("ghost@a.test", ghost.address.clone());

    let err = mail::send_alert(&router, "x", &bob, "ghost@a.test", &bob_server.location).unwrap_err();
    assert!(matches!(err, Error::Remote { code, .. } if code == wire::codes::NOT_REGISTERED));
}

#[test]
fn test_self_feed_with_recorded_copies() {
    let server = TestServer::spawn();
    let (alice, client) = server.user("Alice");
    let bob = Identity::create();
    let app_store = InMemoryMailStore::new();
    let user = User::new("Alice", "");
    let router = LocalRouter::new();

    let mut private = note(&alice, "to bob");
    private.recipient = Some(bob.address.clone());
    let private_name = mail::publish_and_record(
        &router,
        &client,
        &app_store,
        &private,
        &[bob.address.clone()],
        "",
        false,
    )
    .unwrap();
    let hello = note(&alice, "hello all");
    mail::publish_and_record(&router, &client, &app_store, &hello, &[], "", false).unwrap();

    let options = FeedOptions {
        include_self: true,
        since: Utc::now().timestamp() - 60,
        ..FeedOptions::default()
    };
    let feed = mail::messages(&router, &app_store, &alice, &user, options).unwrap();

    assert_eq!(feed.len(), 2);
    assert!(feed.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    let sent = feed.iter().find(|m| m.name == private_name).unwrap();
    assert_eq!(sent.mail.recipient, Some(Address::from_fingerprint(bob.fingerprint())));
    assert_eq!(sent.mail.component(components::BODY), Some(&b"to bob"[..]));
}

#[test]
fn test_sent_copy_in_home_store_keeps_message_served() {
    let server = TestServer::spawn();
    let (alice, client) = server.user("Alice");
    let reader = Identity::create();
    let router = LocalRouter::new();
    router.insert("alice@test", alice.address.clone());

    let draft = note(&alice, "draft");
    let name = mail::publish_and_record(
        &router,
        &client,
        server.store.as_ref(),
        &draft,
        &[],
        "",
        false,
    )
    .unwrap();
    assert_eq!(
        server.store.messages_with_name(&name, alice.fingerprint()).unwrap().len(),
        1
    );

    let fetched = mail::download_message(&router, &name, &reader, "alice@test", None).unwrap();
    assert_eq!(fetched.component(components::BODY), Some(&b"draft"[..]));

    client.update_message(&note(&alice, "final"), &[], &name).unwrap();
    let fetched = mail::download_message(&router, &name, &reader, "alice@test", None).unwrap();
    assert_eq!(fetched.component(components::BODY), Some(&b"final"[..]));
}

#[test]
fn test_alert_flag_notifies_recipients() {
    let alice_server = TestServer::spawn();
    let bob_server = TestServer::spawn();
    let (alice, alice_client) = alice_server.user("Alice");
    let (bob, _) = bob_server.user("Bob");

    // The sender knows bob's keys but not his server; the router supplies it
    let router = LocalRouter::new();
    router.insert(bob.fingerprint(), bob.address.clone());
    let mut to = bob.address.clone();
    to.location = String::new();

    let mut secret = note(&alice, "psst");
    secret.recipient = Some(bob.address.clone());
    let since = Utc::now().timestamp() - 60;
    let name = mail::publish_and_record(
        &router,
        &alice_client,
        alice_server.store.as_ref(),
        &secret,
        &[to],
        "",
        true,
    )
    .unwrap();

    let alerts = bob_server.store.alerts_since(bob.fingerprint(), since).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].name, name);
    assert_eq!(alerts[0].from, alice.fingerprint());
    assert_eq!(alerts[0].location, alice_server.location);

    let opened = mail::download_message_from_alert(&router, &alerts[0], &bob).unwrap();
    assert_eq!(opened.component(components::BODY), Some(&b"psst"[..]));
}

#[test]
fn test_full_feed_against_home_store() {
    let alice_server = TestServer::spawn();
    let bob_server = TestServer::spawn();
    let (alice, alice_client) = alice_server.user("Alice");
    let (bob, bob_client) = bob_server.user("Bob");
    let home = alice_server.store.as_ref();

    let router = LocalRouter::new();
    router.insert("alice@a.test", alice.address.clone());
    router.insert("bob@b.test", bob.address.clone());

    let user = home.user_for_fingerprint(alice.fingerprint()).unwrap().unwrap();
    home.insert_subscription(Subscription::new(user.id, "bob@b.test"))
        .unwrap();
    let since = Utc::now().timestamp() - 60;

    let post = note(&bob, "public post");
    let bob_store = bob_server.store.as_ref();
    mail::publish_and_record(&router, &bob_client, bob_store, &post, &[], "", false).unwrap();

    let mut to_alice = note(&bob, "hi alice");
    to_alice.recipient = Some(alice.address.clone());
    mail::publish_and_record(
        &router,
        &bob_client,
        bob_store,
        &to_alice,
        &[alice.address.clone()],
        "",
        true,
    )
    .unwrap();

    let mut to_bob = note(&alice, "hi bob");
    to_bob.recipient = Some(bob.address.clone());
    mail::publish_and_record(
        &router,
        &alice_client,
        home,
        &to_bob,
        &[bob.address.clone()],
        "",
        true,
    )
    .unwrap();

    let feed = mail::messages(&router, home, &alice, &user, FeedOptions::all(since)).unwrap();

    assert_eq!(feed.len(), 3);
    assert_eq!(feed.iter().filter(|m| m.public).count(), 1);
    assert!(feed.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    let bodies: Vec<_> = feed
        .iter()
        .filter_map(|m| m.mail.component(components::BODY))
        .collect();
    for body in [&b"public post"[..], b"hi alice", b"hi bob"] {
        assert!(bodies.contains(&body));
    }
}

#[test]
fn test_feed_fails_whole_call_on_unreachable_subscription() {
    let server = TestServer::spawn();
    let (alice, client) = server.user("Alice");
    let app_store = InMemoryMailStore::new();
    let user_id = app_store.insert_user(User::new("Alice", "")).unwrap();
    let user = app_store.get_user(user_id).unwrap().unwrap();
    app_store
        .insert_subscription(Subscription::new(user_id, "nobody@nowhere.test"))
        .unwrap();
    let router = LocalRouter::new();
    let mine = note(&alice, "mine");
    mail::publish_and_record(&router, &client, &app_store, &mine, &[], "", false).unwrap();

    let err = mail::messages(&router, &app_store, &alice, &user, FeedOptions::all(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}

#[test]
fn test_lookup_router_through_tracker() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let tracker_location = listener.local_addr().unwrap().to_string();
    let tracker_key = Arc::new(Identity::create());
    let tracker = Server::new(tracker_location.clone(), tracker_key, Arc::new(Tracker::new()));
    thread::spawn(move || tracker.serve(listener));

    let mail_server = TestServer::spawn();
    let (alice, _) = mail_server.user("Alice");

    let registration = TrackerRouter::new(mail_server.key.clone(), tracker_location.clone());
    registration.register(&alice, "alice@example.test").unwrap();

    let location = tracker_location.clone();
    let lookup = LookupRouter::with_locator(mail_server.key.clone(), move |domain| {
        assert_eq!(domain, "example.test");
        location.clone()
    });

    let resolved = lookup.lookup_alias("alice@example.test").unwrap();
    assert_eq!(resolved, alice.address);
    assert_eq!(resolved.location, mail_server.location);

    let profile = mail::get_profile(&lookup, &Identity::create(), "alice@example.test").unwrap();
    assert_eq!(profile.component(components::PROFILE_NAME), Some(&b"Alice"[..]));

    assert!(matches!(
        lookup.lookup_alias("alice"),
        Err(Error::MalformedAlias(_))
    ));
}

#[test]
fn test_sqlite_backed_server() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteMailStore::new(dir.path().join("mailserver.test.sqlite")).unwrap());
    let server = TestServer::spawn_with_store(store);
    let (alice, client) = server.user("Alice");
    let reader = Identity::create();

    let router = LocalRouter::new();
    router.insert("alice@test", alice.address.clone());

    let name = client
        .publish_message(&note(&alice, "persisted"), &[], "", false)
        .unwrap();

    let list = mail::download_public_mail(&router, 0, &reader, "alice@test").unwrap();
    assert_eq!(list.content.len(), 1);
    assert_eq!(list.content[0].name, name);
    assert_eq!(list.content[0].location, server.location);

    let mails = mail::download_message_list(&router, &list, &reader, "alice@test").unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].component(components::BODY), Some(&b"persisted"[..]));
}
