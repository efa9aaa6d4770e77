use std::sync::Arc;
use std::time::Duration;

use chatsync::chatcore::transport::{ReadReceipt, TransportEvent};
use chatsync::loopback::{LoopbackOp, LoopbackTransport};
use chatsync::types::events::BatchAction;
use chatsync::types::{
    CachedMessage, ConversationId, FileAttachment, MessageDraft, MessageKind, SentStatus,
};
use chatsync::{Client, ClientConfig, SyncError};

fn bob() -> ConversationId {
    ConversationId::private("bob")
}

fn seed_bob(transport: &LoopbackTransport, count: i64) {
    transport.seed_history(
        (1..=count).map(|i| CachedMessage::text(bob(), format!("b{i}"), "bob", i * 10, "hi")),
    );
}

async fn logged_in(config: ClientConfig) -> (Arc<Client>, Arc<LoopbackTransport>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Arc::new(LoopbackTransport::default());
    let client = Client::new(config, transport.clone());
    client.login("me").await.expect("login should succeed");
    (client, transport)
}

fn times(messages: &[CachedMessage]) -> (i64, i64) {
    (
        messages.first().map(|m| m.sent_time).unwrap_or_default(),
        messages.last().map(|m| m.sent_time).unwrap_or_default(),
    )
}

#[tokio::test]
async fn test_history_pages_into_the_past_and_reuses_the_window() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    seed_bob(&transport, 70);

    let newest = client.request_history(&bob(), 0, true).await.unwrap();
    assert_eq!(newest.messages.len(), 30);
    assert_eq!(times(&newest.messages), (410, 700));
    assert!(newest.has_more);

    let older = client.request_history(&bob(), 410, true).await.unwrap();
    assert_eq!(times(&older.messages), (110, 400));
    assert!(older.has_more);
    assert_eq!(transport.calls(LoopbackOp::FetchHistory), 2);

    // Everything above is cached now.
    let again = client.request_history(&bob(), 0, true).await.unwrap();
    assert_eq!(times(&again.messages), (410, 700));
    assert_eq!(transport.calls(LoopbackOp::FetchHistory), 2);

    let oldest = client.request_history(&bob(), 110, true).await.unwrap();
    assert_eq!(oldest.messages.len(), 10);
    assert!(!oldest.has_more);
    assert_eq!(transport.calls(LoopbackOp::FetchHistory), 3);

    let newer = client.request_history(&bob(), 400, false).await.unwrap();
    assert_eq!(times(&newer.messages), (410, 700));
    assert!(!newer.has_more);
    assert_eq!(transport.calls(LoopbackOp::FetchHistory), 3);

    let window = client.cached_window(&bob()).unwrap();
    assert_eq!(window.len(), 70);
    assert!(window.is_consistent());
}

#[tokio::test]
async fn test_failed_top_up_returns_the_cached_part() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    seed_bob(&transport, 70);
    client.request_history(&bob(), 0, true).await.unwrap();

    transport.fail_next(LoopbackOp::FetchHistory, 503);
    let page = client.request_history(&bob(), 500, true).await.unwrap();
    assert_eq!(times(&page.messages), (410, 490));
    assert!(page.has_more);
    assert_eq!(page.fetch_error, Some(SyncError::Transport(503)));

    transport.fail_next(LoopbackOp::FetchHistory, 503);
    let carol = ConversationId::private("carol");
    assert_eq!(
        client.request_history(&carol, 0, true).await,
        Err(SyncError::Transport(503))
    );
    assert_eq!(
        client
            .request_history(&ConversationId::private(""), 0, true)
            .await,
        Err(SyncError::InvalidConversation)
    );
}

#[tokio::test]
async fn test_send_resets_a_window_detached_from_the_present() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    seed_bob(&transport, 70);

    let middle = client.request_history(&bob(), 300, false).await.unwrap();
    assert_eq!(times(&middle.messages), (310, 600));
    assert!(client.cached_window(&bob()).unwrap().has_more_after_end);

    let mut inserted = client.event_bus().messages_inserted.subscribe();
    let mut changed = client.event_bus().message_state_changed.subscribe();
    let sent = client.send(&bob(), MessageDraft::text("hey")).await.unwrap();
    assert_eq!(sent.sent_status, SentStatus::Sent);
    assert_eq!(sent.message_uid.as_deref(), Some("srv-1"));

    let pending = inserted.try_recv().unwrap();
    assert_eq!(pending[0].sent_status, SentStatus::Sending);
    assert_eq!(changed.try_recv().unwrap()[0].message_uid.as_deref(), Some("srv-1"));

    let window = client.cached_window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert!(!window.has_more_after_end);
    assert!(window.has_more_before_start);

    let latest = client.request_history(&bob(), 0, true).await.unwrap();
    assert_eq!(latest.messages.len(), 30);
    assert_eq!(latest.messages[0].sent_time, 420);
    assert_eq!(
        latest.messages.last().unwrap().message_uid.as_deref(),
        Some("srv-1")
    );
}

#[tokio::test]
async fn test_failed_send_can_be_resent() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    transport.fail_next(LoopbackOp::Send, 500);

    let result = client.send(&bob(), MessageDraft::text("first try")).await;
    assert_eq!(result, Err(SyncError::Transport(500)));
    let failed = client.cached_window(&bob()).unwrap().messages()[0].clone();
    assert_eq!(failed.sent_status, SentStatus::Failed);

    let resent = client.resend(&failed).await.unwrap();
    assert_eq!(resent.sent_status, SentStatus::Sent);
    assert_ne!(resent.transaction_id, failed.transaction_id);

    let window = client.cached_window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window.messages()[0].message_uid, resent.message_uid);
    assert_eq!(transport.sent_messages().len(), 1);

    // Anything but FAILED comes back untouched.
    assert_eq!(client.resend(&resent).await.unwrap(), resent);
    assert_eq!(transport.sent_messages().len(), 1);
}

#[tokio::test]
async fn test_forward_sends_copies() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    seed_bob(&transport, 2);
    let page = client.request_history(&bob(), 0, true).await.unwrap();

    let carol = ConversationId::private("carol");
    let results = client.forward(&carol, page.messages).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));
    let sent = transport.sent_messages();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.conversation == carol && m.sender_user_id == "me"));
}

#[tokio::test]
async fn test_delete_reports_partial_failure() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    seed_bob(&transport, 3);
    let page = client.request_history(&bob(), 0, true).await.unwrap();
    let mut partial = client.event_bus().partial_failure.subscribe();

    transport.fail_next(LoopbackOp::Delete, 7);
    let deleted = client
        .delete_messages(&bob(), page.messages.clone(), false)
        .await
        .unwrap();
    assert_eq!(deleted.len(), 2);

    client.flush_events();
    let warning = partial.try_recv().unwrap();
    assert_eq!(warning.action, BatchAction::Delete);
    assert_eq!((warning.attempted, warning.failed), (3, 1));

    let window = client.cached_window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window.messages()[0].message_uid.as_deref(), Some("b1"));

    transport.fail_next(LoopbackOp::Delete, 7);
    let result = client
        .delete_messages(&bob(), vec![window.messages()[0].clone()], false)
        .await;
    assert_eq!(result, Err(SyncError::Transport(7)));
}

#[tokio::test]
async fn test_recall_replaces_the_message_in_place() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    seed_bob(&transport, 2);
    let page = client.request_history(&bob(), 0, true).await.unwrap();
    let mut deleted_events = client.event_bus().messages_deleted.subscribe();

    let deleted = client
        .delete_messages(&bob(), vec![page.messages[1].clone()], true)
        .await
        .unwrap();
    let notice = deleted[0].recall.clone().expect("recall notice");
    assert_eq!(notice.kind, MessageKind::Recall);
    assert_eq!(notice.recalled_uid.as_deref(), Some("b2"));
    assert_eq!(deleted_events.try_recv().unwrap().len(), 1);

    let window = client.cached_window(&bob()).unwrap();
    assert_eq!(window.len(), 2);
    assert_eq!(window.messages()[1].kind, MessageKind::Recall);
    assert_eq!(window.messages()[1].sent_time, 20);
}

#[tokio::test(start_paused = true)]
async fn test_file_send_reports_progress_and_rejects_bad_sizes() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    transport.set_upload_delay(Duration::from_millis(100));
    let mut progress = client.event_bus().upload_progress.subscribe();
    let mut rejected = client.event_bus().file_send_failed.subscribe();

    let results = client
        .send_files(
            &bob(),
            vec![
                FileAttachment::new("a.jpg", 1000, "/tmp/a.jpg"),
                FileAttachment::new("empty.txt", 0, "/tmp/empty.txt"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let message = results[0].clone().unwrap();
    assert_eq!(message.kind, MessageKind::Image);
    assert_eq!(message.sent_status, SentStatus::Sent);
    assert_eq!(message.progress, Some(100));
    assert!(message.media_url().unwrap().starts_with("loopback://files/"));

    client.flush_events();
    let skipped = rejected.try_recv().unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].name, "empty.txt");

    let mut seen = Vec::new();
    while let Ok(update) = progress.try_recv() {
        seen.push(update.progress);
    }
    assert_eq!(seen, vec![0, 50, 100]);
}

#[tokio::test]
async fn test_too_many_files_is_rejected_up_front() {
    let config = ClientConfig {
        max_upload_files: 2,
        ..ClientConfig::default()
    };
    let (client, _transport) = logged_in(config).await;
    let files = (0..3)
        .map(|i| FileAttachment::new(format!("{i}.txt"), 10, "/tmp"))
        .collect();
    assert_eq!(
        client.send_files(&bob(), files).await,
        Err(SyncError::TooManyFiles { max: 2 })
    );
    assert!(client.cached_window(&bob()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pending_upload() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    transport.set_upload_delay(Duration::from_millis(1000));

    let sender = client.clone();
    let task = tokio::spawn(async move {
        sender
            .send_files(&bob(), vec![FileAttachment::new("doc.pdf", 4096, "/tmp/doc.pdf")])
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pending = client.cached_window(&bob()).unwrap().messages()[0].clone();
    assert_eq!(pending.sent_status, SentStatus::Sending);
    assert!(client.cancel_pending_send(&pending));

    let results = task.await.unwrap().unwrap();
    assert_eq!(results, vec![Err(SyncError::TaskCancelled)]);
    assert!(client.cached_window(&bob()).unwrap().is_empty());
    assert!(transport.sent_messages().is_empty());
}

#[tokio::test]
async fn test_read_receipts_in_both_directions() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    seed_bob(&transport, 3);
    client.request_history(&bob(), 0, true).await.unwrap();

    client.send_read_receipt(&bob()).await.unwrap();
    client.send_read_receipt(&bob()).await.unwrap();
    assert_eq!(
        transport.read_receipts(),
        vec![(bob(), "b3".to_string(), 30)]
    );

    let sent = client.send(&bob(), MessageDraft::text("seen?")).await.unwrap();
    let mut changed = client.event_bus().message_state_changed.subscribe();
    client
        .handle_transport_event(TransportEvent::ReadReceipt(ReadReceipt::Private {
            conversation: bob(),
            end_time: sent.sent_time,
        }))
        .await;
    let read = changed.try_recv().unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].sent_status, SentStatus::Read);

    // A live message makes the next receipt necessary again.
    let live = CachedMessage::text(bob(), "b4", "bob", sent.sent_time + 5, "yes");
    client
        .handle_transport_event(TransportEvent::MessagesReceived(vec![live]))
        .await;
    client.send_read_receipt(&bob()).await.unwrap();
    assert_eq!(transport.read_receipts().len(), 2);
    assert_eq!(transport.read_receipts()[1].1, "b4");
}

#[tokio::test(start_paused = true)]
async fn test_logout_cancels_pending_sends() {
    let (client, transport) = logged_in(ClientConfig::default()).await;
    transport.set_send_delay(Duration::from_millis(500));

    let sender = client.clone();
    let task =
        tokio::spawn(async move { sender.send(&bob(), MessageDraft::text("late")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.logout();
    assert_eq!(task.await.unwrap(), Err(SyncError::TaskCancelled));
    assert!(client.cached_window(&bob()).is_none());
    assert!(!client.is_logged_in());
}
