//! Two clients chatting: create a conversation, send, receive, read.
//!
//! Run with: cargo run --example chat -p imkit
//!
//! Requires a messaging server. Set IMKIT_SERVER (ws:// or http:// URL) and
//! IMKIT_APP_ID, or it defaults to a local development server.

use std::time::Duration;

use imkit::prelude::*;

const DEFAULT_SERVER: &str = "ws://127.0.0.1:7070";
const DEFAULT_APP_ID: &str = "local-dev";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = std::env::var("IMKIT_SERVER").unwrap_or_else(|_| DEFAULT_SERVER.to_string());
    let app_id = std::env::var("IMKIT_APP_ID").unwrap_or_else(|_| DEFAULT_APP_ID.to_string());
    let realtime = Realtime::new(RealtimeConfig::new(app_id).server(server))?;

    realtime.on(|event| println!("  [realtime] {:?}", event));

    // ── Open two sessions over the same connection ──
    println!("=== Opening sessions ===");
    let alice = realtime.create_im_client("alice", ClientOptions::new()).await?;
    let bob = realtime.create_im_client("bob", ClientOptions::new()).await?;
    println!("  alice and bob are online");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bob.on(move |event| {
        if let ClientEvent::Message { conversation, message } = event {
            let _ = tx.send((conversation.clone(), message.clone()));
        }
    });

    // ── Alice starts a conversation and sends with a receipt ──
    println!("\n=== Sending ===");
    let conversation = alice
        .create_conversation(ConversationOptions::new().members(["bob"]).name("lunch"))
        .await?;
    conversation.on(|event| {
        if let ConversationEvent::Receipt { message } = event {
            println!("  delivered: {:?}", message.id());
        }
    });

    let mut message = Message::text("noodles at noon?");
    message.set_mention_list(["bob"]);
    conversation
        .send(&mut message, SendOptions::new().receipt(true))
        .await?;
    println!("  sent {:?} at {:?}", message.id(), message.timestamp());

    // ── Bob receives and reads ──
    println!("\n=== Receiving ===");
    if let Ok(Some((incoming, received))) =
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
    {
        println!(
            "  bob got {:?} in {} (mentioned: {}, unread: {})",
            received.payload(),
            incoming.id(),
            bob.is_mentioned(&received),
            incoming.unread_messages_count()
        );
        incoming.read().await?;
        println!("  unread after read: {}", incoming.unread_messages_count());
    } else {
        println!("  nothing arrived within 5s");
    }

    // ── History ──
    println!("\n=== History ===");
    let mut pages = conversation.create_messages_iterator(10)?;
    while let Some(page) = pages.next_page().await? {
        for stored in page {
            println!("  {:?} {:?}", stored.timestamp(), stored.payload());
        }
    }

    // ── Presence ──
    let online = alice.ping(["bob", "carol"]).await?;
    println!("\n=== Online: {:?} ===", online);

    realtime.close().await?;
    println!("\nDone!");
    Ok(())
}
