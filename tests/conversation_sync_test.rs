use std::sync::Arc;
use std::time::Duration;

use chatsync::chatcore::engine::SyncPhase;
use chatsync::chatcore::transport::{Transport, TransportEvent};
use chatsync::loopback::{LoopbackOp, LoopbackTransport};
use chatsync::types::{
    CachedMessage, ConversationId, ConversationNotification, NotificationLevel,
    RemoteConversation, UpdatedItems,
};
use chatsync::{Client, ClientConfig, SyncError};

const NOW: i64 = 1_000_000;

fn peer(i: usize) -> ConversationId {
    ConversationId::private(format!("peer{i}"))
}

fn remote(i: usize) -> RemoteConversation {
    let sent_time = NOW - (i as i64 + 1) * 1000;
    let latest = CachedMessage::text(
        peer(i),
        format!("m{i}"),
        format!("peer{i}"),
        sent_time,
        "hello",
    );
    let mut remote = RemoteConversation::new(peer(i)).with_latest(latest);
    remote.unread_count = (i % 4) as u32;
    remote
}

fn test_config() -> ClientConfig {
    ClientConfig {
        first_page_count: 10,
        full_page_count: 20,
        page_interval_ms: 10,
        retry_backoff_ms: 100,
        ..ClientConfig::default()
    }
}

fn setup(conversations: usize) -> (Arc<Client>, Arc<LoopbackTransport>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Arc::new(LoopbackTransport::new(NOW));
    transport.seed_conversations((0..conversations).map(remote));
    let client = Client::new(test_config(), transport.clone());
    (client, transport)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}

async fn steady(conversations: usize) -> (Arc<Client>, Arc<LoopbackTransport>) {
    let (client, transport) = setup(conversations);
    client.login("me").await.unwrap();
    client
        .handle_transport_event(TransportEvent::OfflineSyncFinished)
        .await;
    wait_for(|| client.sync_phase() == SyncPhase::Steady).await;
    (client, transport)
}

#[tokio::test(start_paused = true)]
async fn test_first_screen_then_full_sync_with_buffered_live_messages() {
    let (client, transport) = setup(50);
    let mut resets = client.event_bus().conversation_list_reset.subscribe();
    client.login("me").await.unwrap();

    wait_for(|| client.conversation_list().len() == 10).await;
    assert_eq!(client.sync_phase(), SyncPhase::InitialSync);
    let (first, more) = client.more_conversations(None, 5);
    assert_eq!(first.len(), 5);
    assert!(more, "the list is still incomplete");
    assert_eq!(
        client.open_conversation(&peer(1)),
        Err(SyncError::ListNotReady)
    );

    let newbie = ConversationId::private("newbie");
    let live = CachedMessage::text(newbie.clone(), "n1", "newbie", NOW + 500, "hi there");
    client
        .handle_transport_event(TransportEvent::MessagesReceived(vec![live]))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.find_conversation(&newbie).is_none());

    client
        .handle_transport_event(TransportEvent::OfflineSyncFinished)
        .await;
    wait_for(|| client.sync_phase() == SyncPhase::Steady).await;
    wait_for(|| client.find_conversation(&newbie).is_some()).await;
    assert_eq!(transport.calls(LoopbackOp::FetchConversations), 5);

    let list = client.conversation_list();
    assert_eq!(list.len(), 51);
    assert_eq!(list[0].id, newbie);
    assert_eq!(list[0].unread_count, 1);
    assert_eq!(list[1].id, peer(0));
    assert!(list.windows(2).all(|w| w[0].update_time >= w[1].update_time));
    assert_eq!(client.more_conversations(Some(&peer(48)), 10), (vec![list[50].clone()], false));

    client.flush_events();
    let mut last = None;
    while let Ok(reset) = resets.try_recv() {
        last = Some(reset);
    }
    assert_eq!(last.expect("list reset events").len(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_first_screen_is_retried_after_a_failure() {
    let (client, transport) = setup(12);
    transport.fail_next(LoopbackOp::FetchConversations, 500);
    client.login("me").await.unwrap();

    wait_for(|| client.conversation_list().len() == 10).await;
    assert_eq!(transport.calls(LoopbackOp::FetchConversations), 2);
}

#[tokio::test(start_paused = true)]
async fn test_full_sync_drops_conversations_gone_remotely() {
    let (client, transport) = setup(5);
    let mut removed = client.event_bus().conversation_removed.subscribe();
    client.login("me").await.unwrap();
    wait_for(|| client.conversation_list().len() == 5).await;

    // Removed on another device between the first screen and the full sync.
    transport.remove_conversation(&peer(3)).await.unwrap();
    client
        .handle_transport_event(TransportEvent::OfflineSyncFinished)
        .await;
    wait_for(|| client.sync_phase() == SyncPhase::Steady).await;

    assert_eq!(client.conversation_list().len(), 4);
    assert!(client.find_conversation(&peer(3)).is_none());
    client.flush_events();
    assert_eq!(removed.try_recv().unwrap()[0].id, peer(3));
}

#[tokio::test(start_paused = true)]
async fn test_local_actions_update_list_and_server() {
    let (client, transport) = steady(10).await;

    client.set_top(&peer(5), true).await.unwrap();
    assert_eq!(client.conversation_list()[0].id, peer(5));
    assert!(
        transport
            .remote_conversations()
            .iter()
            .any(|c| c.id == peer(5) && c.is_top)
    );
    assert_eq!(
        client.set_top(&ConversationId::private("nobody"), true).await,
        Err(SyncError::ConversationNotFound)
    );

    assert_eq!(client.find_conversation(&peer(1)).unwrap().unread_count, 1);
    client.mark_read(&peer(1)).await.unwrap();
    assert_eq!(client.find_conversation(&peer(1)).unwrap().unread_count, 0);

    client.mark_unread(&peer(2)).unwrap();
    assert!(client.find_conversation(&peer(2)).unwrap().mark_unread);

    client
        .set_notification_level(&peer(3), NotificationLevel::Muted)
        .await
        .unwrap();
    assert_eq!(
        client.find_conversation(&peer(3)).unwrap().notification_level,
        NotificationLevel::Muted
    );

    client.set_draft(&peer(6), "unfinished").await.unwrap();
    let list = client.conversation_list();
    assert_eq!(list[0].id, peer(5));
    assert_eq!(list[1].id, peer(6));
    assert_eq!(list[1].draft, "unfinished");
}

#[tokio::test(start_paused = true)]
async fn test_open_and_delete_conversation() {
    let (client, transport) = steady(10).await;
    let mut selected = client.event_bus().conversation_selected.subscribe();

    let opened = client.open_conversation(&peer(7)).unwrap();
    assert_eq!(opened.id, peer(7));
    assert_eq!(client.selected_conversation().unwrap().id, peer(7));

    let removed = client.delete_conversation(&peer(7)).await.unwrap();
    assert_eq!(removed.id, peer(7));
    assert!(client.selected_conversation().is_none());
    assert_eq!(client.conversation_list().len(), 9);
    assert!(transport.remote_conversations().iter().all(|c| c.id != peer(7)));

    client.flush_events();
    assert_eq!(selected.try_recv().unwrap().as_ref().as_ref().unwrap().id, peer(7));
    assert!(selected.try_recv().unwrap().is_none());

    // Opening an unknown conversation lists it on top.
    let stranger = ConversationId::private("stranger");
    client.open_conversation(&stranger).unwrap();
    assert_eq!(client.conversation_list()[0].id, stranger);
}

#[tokio::test(start_paused = true)]
async fn test_remote_changes_reach_the_list() {
    let (client, transport) = steady(6).await;

    let mut pinned = remote(4);
    pinned.is_top = true;
    client
        .handle_transport_event(TransportEvent::ConversationChanged(vec![
            ConversationNotification {
                conversation: pinned,
                updated: UpdatedItems {
                    is_top: Some(true),
                    ..Default::default()
                },
            },
        ]))
        .await;
    assert_eq!(client.conversation_list()[0].id, peer(4));

    assert_eq!(client.find_conversation(&peer(2)).unwrap().unread_count, 2);
    let mut read_elsewhere = remote(2);
    read_elsewhere.unread_count = 0;
    transport.seed_conversations([read_elsewhere]);
    client
        .handle_transport_event(TransportEvent::ReadStatusSynced(peer(2)))
        .await;
    assert_eq!(client.find_conversation(&peer(2)).unwrap().unread_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_logout_empties_the_list() {
    let (client, _transport) = steady(4).await;
    let mut resets = client.event_bus().conversation_list_reset.subscribe();

    client.logout();
    assert!(client.conversation_list().is_empty());
    assert_eq!(client.sync_phase(), SyncPhase::InitialSync);
    client.flush_events();
    let mut last = None;
    while let Ok(reset) = resets.try_recv() {
        last = Some(reset);
    }
    assert!(last.expect("list reset event").is_empty());

    // Events arriving after logout are ignored.
    client
        .handle_transport_event(TransportEvent::OfflineSyncFinished)
        .await;
    assert_eq!(client.sync_phase(), SyncPhase::InitialSync);
}
