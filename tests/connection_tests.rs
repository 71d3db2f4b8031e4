mod common;

use common::{mock_endpoint, MockConnector, OpenStep};
use portlink::domain::config::{OverflowPolicy, ReconnectPolicy, WritePolicy};
use portlink::{
    ChannelSubscriber, ConnectionEvent, ConnectionManager, ConnectionState, ErrorInfo, ErrorKind,
    PortLinkError, Record,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

/// Connection manager behaviour against scripted transports
#[cfg(test)]
mod connection_tests {
    use super::*;
    use ConnectionState::*;

    const WAIT: Duration = Duration::from_secs(30);

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn fast_reconnect(seed_ms: u64, cap_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff_seed_ms: seed_ms,
            backoff_cap_ms: cap_ms,
            ..ReconnectPolicy::default()
        }
    }

    fn subscribe(manager: &ConnectionManager) -> UnboundedReceiver<ConnectionEvent> {
        let (subscriber, events) = ChannelSubscriber::new();
        manager.subscribe(Arc::new(subscriber));
        events
    }

    /// States received so far, without waiting
    fn drain_states(events: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::State { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    /// Wait for `state`, returning the error it carried
    async fn wait_state(
        events: &mut UnboundedReceiver<ConnectionEvent>,
        wanted: ConnectionState,
    ) -> Option<ErrorInfo> {
        loop {
            let event = timeout(WAIT, events.recv())
                .await
                .expect("timed out waiting for state")
                .expect("event channel closed");
            if let ConnectionEvent::State { state, error } = event {
                if state == wanted {
                    return error;
                }
            }
        }
    }

    async fn next_records(
        events: &mut UnboundedReceiver<ConnectionEvent>,
        count: usize,
    ) -> Vec<Record> {
        let mut records = Vec::new();
        while records.len() < count {
            let event = timeout(WAIT, events.recv())
                .await
                .expect("timed out waiting for records")
                .expect("event channel closed");
            if let ConnectionEvent::Record(record) = event {
                records.push(record);
            }
        }
        records
    }

    async fn next_error(events: &mut UnboundedReceiver<ConnectionEvent>) -> ErrorInfo {
        loop {
            let event = timeout(WAIT, events.recv())
                .await
                .expect("timed out waiting for an error")
                .expect("event channel closed");
            if let ConnectionEvent::Error(error) = event {
                return error;
            }
        }
    }

    fn payloads(records: &[Record]) -> Vec<Vec<u8>> {
        records.iter().map(|r| r.as_bytes().to_vec()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let connector = MockConnector::new(
            [OpenStep::Refuse, OpenStep::Refuse, OpenStep::Refuse],
            OpenStep::Accept,
        );
        let config = mock_endpoint().with_reconnect(fast_reconnect(100, 1000));
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        assert!(manager.wait_for_state(Connected, WAIT).await);

        let times = connector.open_times();
        let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
        assert_eq!(gaps, vec![ms(100), ms(200), ms(400)]);

        assert_eq!(
            drain_states(&mut events),
            vec![
                Disconnected,
                Connecting,
                Failed,
                Connecting,
                Failed,
                Connecting,
                Failed,
                Connecting,
                Connected
            ]
        );
        assert_eq!(manager.stats().failures, 3);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state_carries_connect_error() {
        let connector = MockConnector::new([OpenStep::Refuse], OpenStep::Accept);
        let config = mock_endpoint().with_reconnect(fast_reconnect(100, 100));
        let manager = ConnectionManager::new(config, connector).unwrap();
        let mut events = subscribe(&manager);

        let error = wait_state(&mut events, Failed).await.expect("failure without error");
        assert_eq!(error.kind, ErrorKind::Connect);
        assert!(error.message.contains("refused"));

        assert!(wait_state(&mut events, Connected).await.is_none());
        assert_eq!(manager.last_error(), None);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribers_see_identical_record_order() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint().with_split_char(b'\n');
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut first = subscribe(&manager);
        let mut second = subscribe(&manager);

        wait_state(&mut first, Connected).await;
        let link = connector.link(0);
        link.push(b"one\ntwo\nth");
        link.push(b"ree\n");

        let a = next_records(&mut first, 3).await;
        let b = next_records(&mut second, 3).await;
        assert_eq!(
            payloads(&a),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(payloads(&a), payloads(&b));

        let sequences: Vec<u64> = a.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(sequences, b.iter().map(|r| r.sequence).collect::<Vec<_>>());

        let stats = manager.stats();
        assert_eq!(stats.bytes_received, 14);
        assert_eq!(stats.records_received, 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_policy_rejects_while_offline() {
        let connector = MockConnector::refusing();
        let config = mock_endpoint().with_reconnect(fast_reconnect(60_000, 60_000));
        let manager = ConnectionManager::new(config, connector).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Failed).await;
        let result = manager.send(&b"lost"[..]).await;
        assert!(matches!(result, Err(PortLinkError::NotConnected)));

        let error = next_error(&mut events).await;
        assert_eq!(error.kind, ErrorKind::NotConnected);
        assert!(error.message.contains("4 bytes"));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_for_connection() {
        let connector = MockConnector::new([OpenStep::Refuse], OpenStep::Accept);
        let config = mock_endpoint()
            .with_reconnect(fast_reconnect(100, 100))
            .with_write_policy(WritePolicy::Block);
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        manager.start();

        let sender = manager.clone();
        let pending = tokio::spawn(async move { sender.send(&b"queued"[..]).await });

        assert!(manager.wait_for_state(Connected, WAIT).await);
        assert_eq!(pending.await.unwrap().unwrap(), 6);
        assert_eq!(connector.link(0).written(), b"queued");
        assert_eq!(manager.stats().bytes_sent, 6);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_policy_flushes_in_order_after_connect() {
        let connector = MockConnector::new([OpenStep::Refuse], OpenStep::Accept);
        let config = mock_endpoint()
            .with_reconnect(fast_reconnect(100, 100))
            .with_write_policy(WritePolicy::Buffer);
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        manager.start();

        let sender = manager.clone();
        let first = tokio::spawn(async move { sender.send(&b"first,"[..]).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let sender = manager.clone();
        let second = tokio::spawn(async move { sender.send(&b"second"[..]).await });

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(connector.link(0).written(), b"first,second");
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_policy_retries_interrupted_write() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint()
            .with_reconnect(fast_reconnect(100, 100))
            .with_write_policy(WritePolicy::Buffer);
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        connector.link(0).fail_writes(true);

        let written = manager.send(&b"retry me"[..]).await.unwrap();
        assert_eq!(written, 8);
        assert_eq!(connector.link_count(), 2);
        assert!(connector.link(0).written().is_empty());
        assert_eq!(connector.link(0).closes(), 1);
        assert_eq!(connector.link(1).written(), b"retry me");

        let error = wait_state(&mut events, Failed).await.expect("failure without error");
        assert_eq!(error.kind, ErrorKind::Io);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_buffer_queue_overflow_is_rejected() {
        let connector = MockConnector::refusing();
        let mut config = mock_endpoint()
            .with_reconnect(fast_reconnect(60_000, 60_000))
            .with_write_policy(WritePolicy::Buffer);
        config.write_queue_limit = 1;
        let manager = ConnectionManager::new(config, connector).unwrap();
        let mut events = subscribe(&manager);
        wait_state(&mut events, Failed).await;

        let sender = manager.clone();
        let held = tokio::spawn(async move { sender.send(&b"held"[..]).await });
        tokio::time::sleep(ms(50)).await;

        let overflow = manager.send(&b"overflow"[..]).await;
        assert!(matches!(overflow, Err(PortLinkError::NotConnected)));
        assert_eq!(next_error(&mut events).await.kind, ErrorKind::NotConnected);

        manager.shutdown().await;
        assert!(matches!(held.await.unwrap(), Err(PortLinkError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_error_is_terminal() {
        let connector = MockConnector::new([], OpenStep::Reject);
        let config = mock_endpoint().with_reconnect(fast_reconnect(10, 10));
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        let error = wait_state(&mut events, Failed).await.expect("failure without error");
        assert_eq!(error.kind, ErrorKind::Config);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.open_count(), 1);
        assert_eq!(manager.state(), Failed);
        assert_eq!(manager.last_error().map(|e| e.kind), Some(ErrorKind::Config));
        assert!(drain_states(&mut events).is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_stays_failed() {
        let connector = MockConnector::refusing();
        let config = mock_endpoint()
            .with_reconnect(ReconnectPolicy {
                max_retries: Some(2),
                ..fast_reconnect(10, 10)
            })
            .with_write_policy(WritePolicy::Block);
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        manager.start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.open_count(), 3);
        assert_eq!(manager.state(), Failed);

        let result = manager.send(&b"late"[..]).await;
        assert!(matches!(result, Err(PortLinkError::NotConnected)));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_eof_triggers_reconnect() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint().with_reconnect(fast_reconnect(10, 10));
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        connector.link(0).eof();

        let error = wait_state(&mut events, Failed).await.expect("failure without error");
        assert_eq!(error.kind, ErrorKind::Io);
        assert!(error.message.contains("closed by peer"));

        wait_state(&mut events, Connected).await;
        assert_eq!(connector.link_count(), 2);
        assert_eq!(connector.link(0).closes(), 1);
        assert_eq!(manager.stats().connects, 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_triggers_reconnect() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint().with_reconnect(fast_reconnect(10, 10));
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        connector.link(0).error(std::io::ErrorKind::ConnectionReset);

        let error = wait_state(&mut events, Failed).await.expect("failure without error");
        assert_eq!(error.kind, ErrorKind::Io);
        wait_state(&mut events, Connected).await;
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_stable_connection() {
        let connector = MockConnector::new(
            [
                OpenStep::Refuse,
                OpenStep::Refuse,
                OpenStep::Accept,
                OpenStep::Refuse,
            ],
            OpenStep::Accept,
        );
        let config = mock_endpoint().with_reconnect(ReconnectPolicy {
            stable_after_ms: 1000,
            ..fast_reconnect(100, 10_000)
        });
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let dropped_at = Instant::now();
        connector.link(0).eof();
        wait_state(&mut events, Connected).await;

        let times = connector.open_times();
        assert_eq!(times.len(), 5);
        assert_eq!(times[3] - dropped_at, ms(100));
        assert_eq!(times[4] - times[3], ms(200));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_drop_policy_reports_and_continues() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint().with_split_char(b'\n').with_buffer_size(4);
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        let link = connector.link(0);
        link.push(b"ok\ntoolong\nfine\n");

        let mut records = Vec::new();
        let error = loop {
            match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                ConnectionEvent::Record(record) => records.push(record),
                ConnectionEvent::Error(error) => break error,
                ConnectionEvent::State { .. } => {}
            }
        };
        // Records cut from the same chunk are delivered before the overflow report.
        assert_eq!(payloads(&records), vec![b"ok".to_vec(), b"fine".to_vec()]);
        assert_eq!(error.kind, ErrorKind::FramingOverflow);

        assert_eq!(manager.state(), Connected);
        assert_eq!(connector.link_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_fatal_policy_reconnects() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint()
            .with_split_char(b'\n')
            .with_buffer_size(4)
            .with_overflow_policy(OverflowPolicy::Fatal)
            .with_reconnect(fast_reconnect(10, 10));
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        connector.link(0).push(b"much too long");

        let error = wait_state(&mut events, Failed).await.expect("failure without error");
        assert_eq!(error.kind, ErrorKind::FramingOverflow);
        wait_state(&mut events, Connected).await;
        assert_eq!(connector.link_count(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timeout_emits_partial_record() {
        let connector = MockConnector::accepting();
        let mut config = mock_endpoint().with_split_char(b'\n');
        config.flush_timeout_ms = Some(50);
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        connector.link(0).push(b"no newline");

        let records = next_records(&mut events, 1).await;
        assert_eq!(payloads(&records), vec![b"no newline".to_vec()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport_once() {
        let connector = MockConnector::accepting();
        let manager = ConnectionManager::new(mock_endpoint(), connector.clone()).unwrap();
        let mut events = subscribe(&manager);

        wait_state(&mut events, Connected).await;
        manager.shutdown().await;
        manager.shutdown().await;

        assert_eq!(drain_states(&mut events), vec![Closing, Disconnected]);
        assert_eq!(connector.link(0).closes(), 1);
        assert!(matches!(
            manager.send(&b"x"[..]).await,
            Err(PortLinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_reconnects_and_continues_sequence() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint().with_split_char(b'\n');
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();

        let (subscriber, mut events) = ChannelSubscriber::new();
        let token = manager.subscribe(Arc::new(subscriber));
        wait_state(&mut events, Connected).await;
        connector.link(0).push(b"a\n");
        assert_eq!(next_records(&mut events, 1).await[0].sequence, 1);

        assert!(manager.unsubscribe(token));
        manager.shutdown().await;
        assert_eq!(connector.link(0).closes(), 1);

        let mut events = subscribe(&manager);
        wait_state(&mut events, Connected).await;
        connector.link(1).push(b"b\n");
        let record = &next_records(&mut events, 1).await[0];
        assert_eq!(record.as_bytes(), b"b");
        assert_eq!(record.sequence, 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_driver() {
        let connector = MockConnector::accepting();
        let config = mock_endpoint().with_keep_alive(true);
        let manager = ConnectionManager::new(config, connector.clone()).unwrap();
        manager.start();
        assert!(manager.wait_for_state(Connected, WAIT).await);

        drop(manager);
        for _ in 0..100 {
            if connector.link(0).closes() == 1 {
                break;
            }
            tokio::time::sleep(ms(10)).await;
        }
        assert_eq!(connector.link(0).closes(), 1);
    }
}
