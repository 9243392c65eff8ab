//! Chat fan-out against the in-process broker.
//!
//! One gateway publishes room messages; two consumer groups (persistence and
//! push) each receive every message independently.
//!
//! ```bash
//! RUST_LOG=chatmq_client=debug cargo run -p chatmq-client --example chat_fanout
//! ```

use chatmq_client::{ConsumeAction, MemoryBroker, Message, Mq, MqConfig, OffsetReset, Record};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    room: String,
    from: String,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    chatmq_observability::logging::init("info");

    let mut config = MqConfig::default();
    config.client_id = "im-gateway".into();
    config.producer.linger_ms = 5;
    config.consumer.auto_offset_reset = OffsetReset::Earliest;
    config.consumer.fetch_max_wait_ms = 50;

    let broker = MemoryBroker::new(4);
    let mq = Mq::connect(config, Arc::new(broker.clone())).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, ChatMessage)>();
    for group in ["message-persist", "push-notify"] {
        let consumer = mq.consumer(group).await?;
        let tx = tx.clone();
        consumer
            .subscribe(&["chat.messages"], move |msg: Message| {
                match msg.decode_json::<ChatMessage>() {
                    Ok(chat) => {
                        let _ = tx.send((group, chat));
                    }
                    Err(e) => tracing::warn!(group, error = %e, "Dropping malformed chat message"),
                }
                ConsumeAction::Continue
            })
            .await?;
    }
    drop(tx);

    let rooms = ["lobby", "ops", "lobby", "random"];
    for (i, room) in rooms.iter().enumerate() {
        let chat = ChatMessage {
            room: room.to_string(),
            from: format!("u-{}", 100 + i),
            text: format!("message {}", i),
        };
        mq.producer()
            .send_json("chat.messages", Some(*room), &chat, Duration::from_secs(1))
            .await?;
    }

    // Fire-and-forget path: batched by linger.
    mq.producer().send_async(
        Record::new("chat.messages", serde_json::to_vec(&ChatMessage {
            room: "ops".into(),
            from: "system".into(),
            text: "deploy finished".into(),
        })?)
        .with_key("ops"),
        |result| {
            if let Err(e) = result {
                tracing::error!(error = %e, "Async send failed");
            }
        },
    );

    let expected = (rooms.len() + 1) * 2;
    for _ in 0..expected {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some((group, chat))) => {
                println!("[{:<15}] #{:<6} {}: {}", group, chat.room, chat.from, chat.text)
            }
            _ => break,
        }
    }

    let health = mq.health().await;
    println!("healthy: {}", health.overall);
    println!("{:#?}", mq.producer().metrics());

    mq.close().await;
    Ok(())
}
