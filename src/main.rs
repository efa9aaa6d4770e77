use chatsync::Client;
use chatsync::chatcore::transport::{Transport, TransportEvent};
use chatsync::config::ClientConfig;
use chatsync::loopback::LoopbackTransport;
use chatsync::types::{
    CachedMessage, ConversationId, FileAttachment, MessageDraft, RemoteConversation,
};
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// A small walk-through of the client against the in-process loopback server.
//
// Usage:
//   cargo run                                 # defaults
//   cargo run -- --user alice --peers 40      # bigger conversation list
//   cargo run -- --config client.json         # JSON config, see ClientConfig

#[derive(Parser, Debug)]
#[command(about = "Conversation and message sync demo")]
struct Args {
    /// Account to log in as.
    #[arg(short, long, default_value = "alice")]
    user: String,
    /// Number of conversations the loopback server starts with.
    #[arg(short, long, default_value_t = 25)]
    peers: usize,
    /// JSON file with client settings.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        if let Err(e) = run_demo(args).await {
            error!("Demo failed: {e:#}");
        }
    });
}

fn seed_server(transport: &LoopbackTransport, peers: usize) {
    let now = transport.server_time();
    for i in 0..peers {
        let peer = ConversationId::private(format!("peer{i}"));
        let base = now - (i as i64 + 1) * 60_000;
        transport.seed_history((0..40).map(|n| {
            CachedMessage::text(
                peer.clone(),
                format!("peer{i}-{n}"),
                format!("peer{i}"),
                base + n * 1_000,
                &format!("message {n} from peer{i}"),
            )
        }));
        let mut remote = RemoteConversation::new(peer.clone()).with_latest(CachedMessage::text(
            peer,
            format!("peer{i}-39"),
            format!("peer{i}"),
            base + 39_000,
            "message 39",
        ));
        remote.unread_count = (i % 4) as u32;
        transport.seed_conversations([remote]);
    }
}

async fn run_demo(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ClientConfig::load(path).await?,
        None => ClientConfig {
            retry_backoff_ms: 500,
            page_interval_ms: 50,
            full_page_count: 10,
            first_page_count: 10,
            ..ClientConfig::default()
        },
    };

    let transport = Arc::new(LoopbackTransport::new(Utc::now().timestamp_millis()));
    seed_server(&transport, args.peers);
    transport.set_upload_delay(Duration::from_millis(200));

    let client = Client::build(config, transport.clone()).await?;

    let mut resets = client.event_bus().conversation_list_reset.subscribe();
    let mut progress = client.event_bus().upload_progress.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(list) = resets.recv() => {
                    info!(target: "Demo", "Conversation list now holds {} entries", list.len());
                }
                Ok(update) = progress.recv() => {
                    info!(target: "Demo", "Upload {} at {}%", update.transaction_id, update.progress);
                }
                else => break,
            }
        }
    });

    let (events_tx, events_rx) = mpsc::channel(32);
    let runner = client.clone();
    tokio::spawn(async move { runner.run(events_rx).await });

    client.login(&args.user).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    events_tx.send(TransportEvent::OfflineSyncFinished).await?;

    let peer = ConversationId::private("peer0");
    let page = client.request_history(&peer, 0, true).await?;
    info!(
        target: "Demo",
        "First history page of peer0: {} messages, more: {}",
        page.messages.len(),
        page.has_more
    );

    let sent = client.send(&peer, MessageDraft::text("hello from the demo")).await?;
    info!(target: "Demo", "Sent {:?} at {}", sent.message_uid, sent.sent_time);

    let results = client
        .send_files(&peer, vec![FileAttachment::new("photo.jpg", 48_000, "/tmp/photo.jpg")])
        .await?;
    for result in results {
        match result {
            Ok(message) => info!(target: "Demo", "File sent: {:?}", message.media_url()),
            Err(e) => warn!(target: "Demo", "File failed: {e}"),
        }
    }

    let now = transport.advance(1_000);
    events_tx
        .send(TransportEvent::MessagesReceived(vec![CachedMessage::text(
            ConversationId::private("peer7"),
            "live-1",
            "peer7",
            now,
            "are you there?",
        )]))
        .await?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    client.flush_events();
    for conversation in client.conversation_list().iter().take(5) {
        info!(
            target: "Demo",
            "{} unread={} top={}",
            conversation.key,
            conversation.unread_count,
            conversation.is_top
        );
    }

    client.logout();
    Ok(())
}
