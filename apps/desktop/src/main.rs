use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    call::{UnavailableMediaSource, UnavailablePeerConnector},
    rest::HttpChatApi,
    ChatSession, SessionConfig, SessionEvent, WsConnector,
};
use shared::domain::UserId;

#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the chat backend, e.g. https://chat.example.com/api
    #[arg(long)]
    api_url: String,
    /// Websocket broker endpoint, e.g. wss://chat.example.com/ws
    #[arg(long)]
    broker_url: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    access_token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let session = ChatSession::new(
        SessionConfig {
            user_id: UserId::from(args.user_id.as_str()),
            display_name: args.display_name,
            access_token: args.access_token.clone(),
        },
        Arc::new(WsConnector::new(args.broker_url)),
        Arc::new(HttpChatApi::new(args.api_url, args.access_token)),
        Arc::new(UnavailableMediaSource),
        Arc::new(UnavailablePeerConnector),
    );

    let mut events = session.subscribe_events();
    session.connect().await?;

    for conversation in session.conversations().await {
        let last = conversation
            .last_message
            .as_ref()
            .map(|last| last.content.as_str())
            .unwrap_or("-");
        println!(
            "{:<30} unread={:<3} last={last}",
            conversation.name, conversation.unread_count
        );
    }
    println!("total unread: {}", session.total_unread().await);
    println!("listening for events, Ctrl-C to quit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::MessageReceived { conversation, message }) => {
                    println!("[{conversation}] {}: {}", message.sender_id, message.content);
                }
                Ok(SessionEvent::IncomingCall { from, sender_name, call_type }) => {
                    let name = sender_name.unwrap_or_else(|| from.to_string());
                    println!("incoming {call_type:?} call from {name}");
                }
                Ok(SessionEvent::ConnectionStateChanged(state)) => {
                    println!("connection: {state:?}");
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    session.logout().await;
    Ok(())
}
