//! End-to-end call scenarios through the event processor

mod common;

use std::time::Duration;

use callbridge_core::{
    AccountingCommand, BridgeConfig, BridgeError, CallEventProcessor, CallId, CallState, CircuitStatus, CommandOutcome,
    Contact, DropOutcome, EventOutcome,
};
use callbridge_transport::{StateTag, TransportKind};

use common::{inbound, outbound, wait_until, FixedChooser, MemoryHistory, MockAccounting, MockTransport, Notification, StaticSource};

const SHARED_NUMBER: &str = "+49 89 11112222";

fn shared_number_contacts() -> Vec<Contact> {
    vec![
        Contact::new("a", "Anna Berg").with_number(SHARED_NUMBER),
        Contact::new("b", "Berg Consulting").organization().with_number("089 11112222"),
    ]
}

fn socket_call(id: &str) -> CallId {
    CallId::new(TransportKind::Socket, id)
}

fn contact_of(processor: &CallEventProcessor, id: &str) -> Option<String> {
    let record = processor.registry().get(&socket_call(id))?;
    let contact = record.lock().contact_id().map(str::to_string);
    contact
}

#[tokio::test(start_paused = true)]
async fn test_chosen_contact_is_preferred_on_next_call() {
    let accounting = MockAccounting::new();
    let chooser = FixedChooser::picking("b");
    let processor = CallEventProcessor::builder(
        BridgeConfig::default().with_disambiguation_delay(Duration::from_millis(500)),
        accounting.clone(),
    )
    .chooser(chooser.clone())
    .build()
    .unwrap();
    processor.directory().load(shared_number_contacts());

    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Offered)).await;
    assert_eq!(contact_of(&processor, "1").as_deref(), Some("a"));

    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Connected)).await;
    wait_until(|| accounting.contact_changes() == 1).await;
    assert_eq!(chooser.presentations(), vec![vec!["a".to_string(), "b".to_string()]]);
    assert_eq!(contact_of(&processor, "1").as_deref(), Some("b"));
    assert_eq!(processor.routing().preferred_contact(SHARED_NUMBER).as_deref(), Some("b"));

    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Ended)).await;

    processor.handle_event(inbound("2", SHARED_NUMBER, StateTag::Offered)).await;
    assert_eq!(contact_of(&processor, "2").as_deref(), Some("b"));
    assert!(accounting.notifications().contains(&Notification::NewCall {
        call_id: "socket:2".into(),
        contact_id: Some("b".into()),
        sync_id: None,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_dial_request_correlates_with_outbound_event() {
    let accounting = MockAccounting::new();
    let transport = MockTransport::new(TransportKind::Socket);
    let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting.clone())
        .transport(transport.clone())
        .build()
        .unwrap();

    processor.dial("+4989112233", "S1", None).await.unwrap();
    assert_eq!(transport.dialed(), vec!["+4989112233".to_string()]);
    assert_eq!(processor.registry().pending_count(), 1);

    processor.handle_event(outbound("8", "0891234567", StateTag::Dialing)).await;
    let unrelated = processor.registry().get(&socket_call("8")).unwrap();
    assert_eq!(unrelated.lock().sync_id, None);
    assert_eq!(processor.registry().pending_count(), 1);

    processor.handle_event(outbound("9", "4989112233", StateTag::Dialing)).await;
    let dialed = processor.registry().get(&socket_call("9")).unwrap();
    assert_eq!(dialed.lock().sync_id.as_deref(), Some("S1"));
    assert_eq!(processor.registry().pending_count(), 0);
    assert!(accounting.notifications().contains(&Notification::NewCall {
        call_id: "socket:9".into(),
        contact_id: None,
        sync_id: Some("S1".into()),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_contact_hint_wins_over_directory_order() {
    let transport = MockTransport::new(TransportKind::Socket);
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .transport(transport)
        .build()
        .unwrap();
    processor.directory().load(shared_number_contacts());

    processor.dial(SHARED_NUMBER, "S2", Some("b".into())).await.unwrap();
    processor.handle_event(outbound("3", "004989 11112222", StateTag::Dialing)).await;

    assert_eq!(contact_of(&processor, "3").as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_accounting_does_not_block_lifecycle() {
    let accounting = MockAccounting::unreachable();
    let history = MemoryHistory::new();
    let processor = CallEventProcessor::builder(BridgeConfig::default().with_failure_threshold(3), accounting.clone())
        .history(history.clone())
        .build()
        .unwrap();

    for state in [StateTag::Offered, StateTag::Accepted, StateTag::Connected, StateTag::Ended] {
        let outcome = processor.handle_event(inbound("5", "0891112222", state)).await;
        assert!(matches!(outcome, EventOutcome::Applied { .. }), "{:?}", outcome);
    }

    assert_eq!(accounting.attempts(), 3);
    assert_eq!(processor.gateway().breaker().status(), CircuitStatus::Open);

    let stats = processor.stats();
    assert_eq!(stats.notifications_failed, 3);
    assert_eq!(stats.notifications_skipped, 2);
    assert_eq!(stats.calls_completed, 1);

    let finished = history.records();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state(), CallState::Disconnected);
    assert!(finished[0].duration().is_some());
    assert!(processor.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_events_are_debounced() {
    let accounting = MockAccounting::new();
    let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting.clone())
        .build()
        .unwrap();

    processor.handle_event(inbound("1", "0891112222", StateTag::Offered)).await;
    let outcome = processor.handle_event(inbound("1", "0891112222", StateTag::Offered)).await;

    assert_eq!(outcome, EventOutcome::Debounced);
    assert_eq!(processor.stats().events_debounced, 1);
    assert_eq!(accounting.notifications().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_event_is_rejected_locally() {
    let accounting = MockAccounting::new();
    let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting.clone())
        .build()
        .unwrap();

    processor.handle_event(inbound("1", "0891112222", StateTag::Offered)).await;
    processor.handle_event(inbound("1", "0891112222", StateTag::Connected)).await;
    let outcome = processor.handle_event(inbound("1", "0891112222", StateTag::Offered)).await;

    assert_eq!(
        outcome,
        EventOutcome::Rejected {
            from: CallState::Connected,
            to: CallState::Offering
        }
    );
    assert_eq!(processor.stats().transitions_rejected, 1);
    assert_eq!(accounting.notifications().len(), 2);

    let stray = processor.handle_event(inbound("77", "0891112222", StateTag::Ended)).await;
    assert!(matches!(stray, EventOutcome::Rejected { .. }));
    assert!(processor.registry().get(&socket_call("77")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_disambiguation() {
    let accounting = MockAccounting::new();
    let chooser = FixedChooser::picking("b");
    let processor = CallEventProcessor::builder(
        BridgeConfig::default().with_disambiguation_delay(Duration::from_secs(2)),
        accounting.clone(),
    )
    .chooser(chooser.clone())
    .build()
    .unwrap();
    processor.directory().load(shared_number_contacts());

    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Offered)).await;
    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Connected)).await;
    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Ended)).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(chooser.presentations().is_empty());
    assert_eq!(accounting.contact_changes(), 0);
    assert!(processor.routing().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_journal_entry_on_disconnect() {
    let accounting = MockAccounting::new();
    let processor = CallEventProcessor::builder(BridgeConfig::default().without_disambiguation(), accounting.clone())
        .build()
        .unwrap();
    processor.directory().load(shared_number_contacts());

    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Offered)).await;
    processor.handle_event(inbound("1", SHARED_NUMBER, StateTag::Ended)).await;

    let journal: Vec<String> = accounting
        .notifications()
        .into_iter()
        .filter_map(|n| match n {
            Notification::Journal { note, .. } => Some(note),
            _ => None,
        })
        .collect();
    assert_eq!(journal, vec![format!("Incoming call from Anna Berg ({}), not answered", SHARED_NUMBER)]);

    let quiet = CallEventProcessor::builder(BridgeConfig::default().with_journal(false), accounting.clone())
        .build()
        .unwrap();
    quiet.handle_event(inbound("2", "0891112222", StateTag::Offered)).await;
    quiet.handle_event(inbound("2", "0891112222", StateTag::Ended)).await;
    let entries = accounting
        .notifications()
        .iter()
        .filter(|n| matches!(n, Notification::Journal { .. }))
        .count();
    assert_eq!(entries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drop_before_connect_withdraws_dial_request() {
    let transport = MockTransport::new(TransportKind::Socket);
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .transport(transport.clone())
        .build()
        .unwrap();

    processor.dial("0891112222", "S1", None).await.unwrap();
    assert_eq!(processor.drop_call("S1").await.unwrap(), DropOutcome::PendingCancelled);
    assert_eq!(processor.registry().pending_count(), 0);
    assert!(transport.dropped().is_empty());

    assert!(matches!(
        processor.drop_call("S1").await,
        Err(BridgeError::UnknownSyncId { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_drop_live_call_goes_to_owning_transport() {
    let transport = MockTransport::new(TransportKind::Socket);
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .transport(transport.clone())
        .build()
        .unwrap();

    let outcome = processor
        .handle_command(AccountingCommand::Dial {
            number: "0891112222".into(),
            sync_id: "S7".into(),
            contact_hint: None,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, CommandOutcome::Dialed(_)));

    processor.handle_event(outbound("21/4", "0891112222", StateTag::Dialing)).await;
    let outcome = processor
        .handle_command(AccountingCommand::Drop { sync_id: "S7".into() })
        .await
        .unwrap();

    assert_eq!(outcome, CommandOutcome::Dropped(DropOutcome::CallDropped));
    assert_eq!(transport.dropped(), vec!["21/4".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_refused_dial_leaves_no_pending_request() {
    let transport = MockTransport::new(TransportKind::Socket);
    transport.refuse_dials();
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .transport(transport.clone())
        .build()
        .unwrap();

    let result = processor.dial("0891112222", "S1", None).await;
    assert!(matches!(result, Err(BridgeError::Transport(_))));
    assert_eq!(processor.registry().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dial_needs_a_connected_transport() {
    let idle = MockTransport::new(TransportKind::LineMonitor);
    idle.set_connected(false);
    let live = MockTransport::new(TransportKind::Socket);
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .transport(idle.clone())
        .transport(live.clone())
        .build()
        .unwrap();

    processor.dial("0891112222", "S1", None).await.unwrap();
    assert!(idle.dialed().is_empty());
    assert_eq!(live.dialed().len(), 1);

    live.set_connected(false);
    assert!(matches!(
        processor.dial("0893334444", "S2", None).await,
        Err(BridgeError::NoActiveTransport)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_removes_calls_without_end() {
    let processor = CallEventProcessor::builder(
        BridgeConfig::default()
            .with_stale_call_timeout(Duration::from_secs(120))
            .with_pending_dial_timeout(Duration::from_secs(60)),
        MockAccounting::new(),
    )
    .build()
    .unwrap();

    processor.handle_event(inbound("1", "0891112222", StateTag::Offered)).await;
    tokio::time::advance(Duration::from_secs(121)).await;

    let report = processor.sweep();
    assert_eq!(report.stale_calls, vec![socket_call("1")]);
    assert!(processor.registry().is_empty());

    let outcome = processor.handle_event(inbound("1", "0891112222", StateTag::Offered)).await;
    assert!(matches!(outcome, EventOutcome::Applied { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_directory_reload_from_source() {
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .contact_source(StaticSource::new(shared_number_contacts()))
        .build()
        .unwrap();

    assert_eq!(processor.reload_directory().await.unwrap(), 2);
    assert_eq!(processor.directory().lookup("0049 89 11112222").len(), 2);

    processor.set_comparison_length(0).unwrap();
    assert_eq!(processor.directory().lookup("4989 11112222").len(), 1);
    assert!(processor.set_comparison_length(4).is_err());

    let without_source = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .build()
        .unwrap();
    assert!(matches!(
        without_source.reload_directory().await,
        Err(BridgeError::NoContactSource)
    ));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let result = CallEventProcessor::builder(BridgeConfig::default().with_failure_threshold(0), MockAccounting::new())
        .build();
    assert!(matches!(result, Err(BridgeError::InvalidConfiguration { .. })));
}

#[tokio::test]
async fn test_shared_processor_handles_calls_from_many_tasks() {
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .build()
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move {
            let id = n.to_string();
            processor.handle_event(inbound(&id, "0891112222", StateTag::Offered)).await;
            processor.handle_event(inbound(&id, "0891112222", StateTag::Ended)).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(processor.registry().is_empty());
    assert_eq!(processor.stats().calls_completed, 8);
}

#[tokio::test(start_paused = true)]
async fn test_number_after_dial_tone_still_matches_dial_request() {
    let accounting = MockAccounting::new();
    let transport = MockTransport::new(TransportKind::Socket);
    let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting.clone())
        .transport(transport.clone())
        .build()
        .unwrap();

    processor.dial("+4989112233", "S1", None).await.unwrap();

    let started = processor.handle_event(outbound("12", "", StateTag::Dialing)).await;
    assert!(matches!(started, EventOutcome::Applied { state: CallState::Dialing, .. }));
    assert_eq!(processor.registry().pending_count(), 1);

    let digits = processor.handle_event(outbound("12", "4989112233", StateTag::Dialing)).await;
    assert_eq!(digits, EventOutcome::Updated { call_id: socket_call("12") });

    let record = processor.registry().get(&socket_call("12")).unwrap();
    assert_eq!(record.lock().remote_number, "4989112233");
    assert_eq!(record.lock().sync_id.as_deref(), Some("S1"));
    assert_eq!(processor.registry().pending_count(), 0);
    assert!(accounting.notifications().contains(&Notification::ContactChanged {
        call_id: "socket:12".into(),
        contact_id: None,
    }));

    processor.handle_event(outbound("12", "4989112233", StateTag::Ringback)).await;
    assert_eq!(processor.stats().events_debounced, 0);
    assert_eq!(processor.stats().transitions_rejected, 0);
}

#[tokio::test(start_paused = true)]
async fn test_number_on_ringback_resolves_contact() {
    let accounting = MockAccounting::new();
    let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting.clone())
        .build()
        .unwrap();
    processor
        .directory()
        .load(vec![Contact::new("c", "Carl Maier").with_number("0891234567")]);

    processor.handle_event(outbound("13", "", StateTag::Dialing)).await;
    assert_eq!(contact_of(&processor, "13"), None);

    let outcome = processor.handle_event(outbound("13", "0891234567", StateTag::Ringback)).await;
    assert!(matches!(outcome, EventOutcome::Applied { state: CallState::Ringback, .. }));
    assert_eq!(contact_of(&processor, "13").as_deref(), Some("c"));
    assert!(accounting.notifications().contains(&Notification::ContactChanged {
        call_id: "socket:13".into(),
        contact_id: Some("c".into()),
    }));

    // a number that was known from the start is not resolved twice
    let changes = accounting.contact_changes();
    processor.handle_event(outbound("13", "0899999999", StateTag::Connected)).await;
    assert_eq!(accounting.contact_changes(), changes);
    assert_eq!(
        processor.registry().get(&socket_call("13")).unwrap().lock().remote_number,
        "0891234567"
    );
}

#[tokio::test(start_paused = true)]
async fn test_hanging_accounting_call_times_out() {
    let accounting = MockAccounting::hanging();
    let processor = CallEventProcessor::builder(
        BridgeConfig::default()
            .with_call_timeout(Duration::from_secs(1))
            .with_failure_threshold(2),
        accounting.clone(),
    )
    .build()
    .unwrap();

    let started = tokio::time::Instant::now();
    processor.handle_event(inbound("14", SHARED_NUMBER, StateTag::Offered)).await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(processor.stats().notifications_failed, 1);

    processor.handle_event(inbound("14", SHARED_NUMBER, StateTag::Connected)).await;
    assert_eq!(processor.gateway().breaker().status(), CircuitStatus::Open);

    // with the circuit open the call finishes without waiting
    let before_end = tokio::time::Instant::now();
    processor.handle_event(inbound("14", SHARED_NUMBER, StateTag::Ended)).await;
    assert_eq!(before_end.elapsed(), Duration::ZERO);
    assert_eq!(accounting.attempts(), 2);
    assert!(processor.registry().is_empty());
    assert_eq!(processor.stats().calls_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_history_store_does_not_stall_the_call() {
    let processor = CallEventProcessor::builder(BridgeConfig::default(), MockAccounting::new())
        .history(MemoryHistory::failing())
        .build()
        .unwrap();

    processor.handle_event(inbound("15", SHARED_NUMBER, StateTag::Offered)).await;
    processor.handle_event(inbound("15", SHARED_NUMBER, StateTag::Ended)).await;

    let stats = processor.stats();
    assert_eq!(stats.history_failures, 1);
    assert_eq!(stats.calls_completed, 1);
    assert!(processor.registry().is_empty());
}
