#[cfg(test)]
mod sim_tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    use crate::core::alerts::model::DeliveryRequest;
    use crate::core::alerts::{
        AlertEngine, AlertState, AlertStateMachine, AlertView, DeliveryChannel, DeliveryStatus, EngineHandle,
        MachineConfig, SessionMode,
    };
    use crate::core::connectivity::ConnectivityMonitor;
    use crate::core::contacts::registry::ContactBook;
    use crate::core::contacts::{ContactRegistry, NewContact, SharedContacts};
    use crate::core::error::DispatchFailure;
    use crate::core::model::{
        ContactId, EmergencyContact, EmergencyType, LocationSample, Position, RawMotionSample, TriggerSource,
    };
    use crate::core::motion::{self, ChannelMotionSensor, MotionConfig, MotionTriggerDetector};

    /// Records every call; failures are scripted per phone number.
    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<DeliveryRequest>>,
        scripted: Mutex<HashMap<String, VecDeque<DispatchFailure>>>,
        broken: Mutex<HashMap<String, DispatchFailure>>,
    }

    impl RecordingChannel {
        fn fail_next(&self, phone: &str, failure: DispatchFailure) {
            self.scripted
                .lock()
                .unwrap()
                .entry(phone.to_string())
                .or_default()
                .push_back(failure);
        }

        fn always_fail(&self, phone: &str, failure: DispatchFailure) {
            self.broken.lock().unwrap().insert(phone.to_string(), failure);
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls_to(&self, phone: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.contact_phone == phone)
                .count()
        }
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DispatchFailure> {
            self.calls.lock().unwrap().push(request.clone());
            if let Some(failure) = self.broken.lock().unwrap().get(&request.contact_phone) {
                return Err(failure.clone());
            }
            match self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&request.contact_phone)
                .and_then(|queue| queue.pop_front())
            {
                Some(failure) => Err(failure),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        handle: EngineHandle,
        channel: Arc<RecordingChannel>,
        contacts: SharedContacts,
        _location: watch::Sender<LocationSample>,
        task: JoinHandle<()>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    fn phone(index: usize) -> String {
        format!("+1555000000{}", index)
    }

    fn harness(contact_count: usize) -> Harness {
        let mut registry = ContactRegistry::new();
        for i in 1..=contact_count {
            registry
                .add(NewContact::new(format!("Contact {}", i), phone(i)))
                .unwrap();
        }
        harness_with(registry)
    }

    fn harness_with(registry: ContactRegistry) -> Harness {
        let contacts = registry.into_shared();

        let position = Position {
            latitude: 39.7392,
            longitude: -104.9903,
            accuracy_meters: 8.0,
        };
        let (location_tx, location_rx) = watch::channel(LocationSample::fix(position, Utc::now()));
        let channel = Arc::new(RecordingChannel::default());
        let machine = AlertStateMachine::new(MachineConfig::default(), Arc::clone(&contacts), location_rx, true);
        let (engine, handle) = AlertEngine::new(
            machine,
            Arc::clone(&channel) as Arc<dyn DeliveryChannel>,
            Duration::from_secs(10),
        );
        handle.watch_contacts(&contacts);
        Harness {
            handle,
            channel,
            contacts,
            _location: location_tx,
            task: engine.spawn(),
        }
    }

    async fn wait_for(handle: &EngineHandle, predicate: impl Fn(&AlertView) -> bool) -> AlertView {
        let mut views = handle.subscribe();
        timeout(Duration::from_secs(300), async {
            loop {
                let current = views.borrow_and_update().clone();
                if predicate(&current) {
                    return current;
                }
                views.changed().await.unwrap();
            }
        })
        .await
        .expect("engine never reached the expected view")
    }

    async fn wait_for_state(handle: &EngineHandle, state: AlertState) -> AlertView {
        wait_for(handle, |view| view.state == state).await
    }

    fn tap(handle: &EngineHandle) {
        handle
            .trigger(TriggerSource::Manual, EmergencyType::Personal, "help me")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_contacts_blocks_without_dispatch() {
        let h = harness(0);
        tap(&h.handle);
        wait_for_state(&h.handle, AlertState::BlockedNoContacts).await;

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.handle.view().state, AlertState::BlockedNoContacts);
        assert_eq!(h.channel.call_count(), 0);

        // Adding a contact clears the block
        h.contacts
            .write()
            .unwrap()
            .add(NewContact::new("Mom", "+15551234567"))
            .unwrap();
        wait_for_state(&h.handle, AlertState::Idle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_each_tick_sends_nothing() {
        for ticks in 1..=4u64 {
            let h = harness(2);
            tap(&h.handle);
            sleep(Duration::from_millis(ticks * 1000 + 500)).await;

            let view = h.handle.view();
            assert_eq!(view.state, AlertState::CountingDown);
            assert_eq!(view.countdown_remaining, Some(5 - ticks as u32));

            h.handle.cancel().unwrap();
            let view = wait_for_state(&h.handle, AlertState::Idle).await;
            assert!(view.deliveries.is_empty());

            sleep(Duration::from_secs(10)).await;
            assert_eq!(h.handle.view().state, AlertState::Idle);
            assert_eq!(h.channel.call_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_sends_after_exactly_five_ticks() {
        let h = harness(3);
        tap(&h.handle);

        sleep(Duration::from_millis(4500)).await;
        assert_eq!(h.handle.view().countdown_remaining, Some(1));
        assert_eq!(h.channel.call_count(), 0);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.channel.call_count(), 3);
        let view = h.handle.view();
        assert_eq!(view.state, AlertState::Sent);
        assert!(view.deliveries.iter().all(|d| d.status == DeliveryStatus::Sent));
    }

    #[tokio::test(start_paused = true)]
    async fn motion_trigger_sends_after_exactly_five_ticks() {
        let h = harness(1);
        let (sensor, feed) = ChannelMotionSensor::pair();
        let bridge = motion::spawn_motion_bridge(
            &sensor,
            MotionTriggerDetector::new(MotionConfig::default()),
            h.handle.clone(),
            EmergencyType::Safety,
            "shake".to_string(),
        )
        .unwrap();

        assert!(feed.push(RawMotionSample::new(0.0, 0.0, 9.8, Duration::from_millis(0))).await);
        assert!(feed.push(RawMotionSample::new(12.0, 8.0, 20.0, Duration::from_millis(200))).await);
        let view = wait_for_state(&h.handle, AlertState::CountingDown).await;
        assert_eq!(view.emergency_type, Some(EmergencyType::Safety));

        // More shaking during the countdown does not start a second alert
        assert!(feed.push(RawMotionSample::new(-12.0, -8.0, 0.0, Duration::from_millis(400))).await);

        sleep(Duration::from_millis(4500)).await;
        assert_eq!(h.channel.call_count(), 0);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.channel.call_count(), 1);
        assert_eq!(h.handle.view().state, AlertState::Sent);
        bridge.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn contacts_snapshot_is_frozen_at_trigger() {
        let h = harness(2);
        tap(&h.handle);
        sleep(Duration::from_secs(2)).await;
        h.contacts
            .write()
            .unwrap()
            .add(NewContact::new("Late Addition", "+15559990000"))
            .unwrap();

        let view = wait_for_state(&h.handle, AlertState::Sent).await;
        assert_eq!(view.deliveries.len(), 2);
        assert_eq!(h.channel.call_count(), 2);
        assert_eq!(h.channel.calls_to("+15559990000"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_failure_never_affects_other_contacts() {
        for n in 1..=5usize {
            let h = harness(n);
            h.channel
                .always_fail(&phone(1), DispatchFailure::Transient("carrier error".to_string()));
            tap(&h.handle);

            let view = wait_for_state(&h.handle, AlertState::Sent).await;
            assert_eq!(view.deliveries.len(), n);
            assert_eq!(view.deliveries[0].status, DeliveryStatus::Abandoned);
            for delivery in &view.deliveries[1..] {
                assert_eq!(delivery.status, DeliveryStatus::Sent);
            }
            // First attempt plus three retries
            assert_eq!(h.channel.calls_to(&phone(1)), 4);
            for i in 2..=n {
                assert_eq!(h.channel.calls_to(&phone(i)), 1);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_ids_in_contact_file_are_dispatched_separately() {
        let stored = |name: &str, index: usize| EmergencyContact {
            id: ContactId(1),
            name: name.to_string(),
            phone: phone(index),
            primary: false,
            relationship: None,
        };
        let registry = ContactRegistry::from_book(ContactBook {
            next_id: 2,
            contacts: vec![stored("Mom", 1), stored("Jane", 2)],
        });
        let h = harness_with(registry);
        h.channel
            .always_fail(&phone(2), DispatchFailure::Rejected("number blocked".to_string()));
        tap(&h.handle);

        let view = wait_for_state(&h.handle, AlertState::Sent).await;
        assert_eq!(view.deliveries.len(), 2);
        assert_ne!(view.deliveries[0].contact_id, view.deliveries[1].contact_id);
        assert_eq!(view.deliveries[0].status, DeliveryStatus::Sent);
        assert_eq!(view.deliveries[1].name, "Jane");
        assert_eq!(view.deliveries[1].status, DeliveryStatus::Abandoned);
        assert_eq!(h.channel.calls_to(&phone(1)), 1);
        assert_eq!(h.channel.calls_to(&phone(2)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_bridge_reports_state_seen_before_subscribing() {
        let mut registry = ContactRegistry::new();
        registry.add(NewContact::new("Mom", phone(1))).unwrap();
        let h = harness_with(registry);

        // The probe already flipped to offline before the bridge started
        let monitor = ConnectivityMonitor::new(true);
        monitor.set_online(false);
        let bridge = h.handle.watch_connectivity(&monitor);

        h.channel
            .fail_next(&phone(1), DispatchFailure::Unreachable("network is down".to_string()));
        tap(&h.handle);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.channel.call_count(), 1);
        assert_eq!(h.handle.view().deliveries[0].status, DeliveryStatus::Pending);

        monitor.set_online(true);
        wait_for_state(&h.handle, AlertState::Sent).await;
        assert_eq!(h.channel.call_count(), 2);
        bridge.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let h = harness(2);
        h.channel.fail_next(&phone(2), DispatchFailure::Timeout);
        tap(&h.handle);

        let view = wait_for(&h.handle, |v| {
            v.deliveries
                .get(1)
                .is_some_and(|d| d.status == DeliveryStatus::Failed { retry_count: 1 })
        })
        .await;
        assert_eq!(view.state, AlertState::Sending);
        assert_eq!(view.deliveries[0].status, DeliveryStatus::Sent);

        let view = wait_for_state(&h.handle, AlertState::Sent).await;
        assert_eq!(view.deliveries[1].status, DeliveryStatus::Sent);
        assert_eq!(h.channel.calls_to(&phone(2)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn practice_alert_never_touches_the_channel() {
        let h = harness(3);
        h.handle
            .run_practice_alert(EmergencyType::Medical, "drill")
            .unwrap();

        let sending = wait_for_state(&h.handle, AlertState::Sending).await;
        assert_eq!(sending.mode, Some(SessionMode::Practice));
        assert_eq!(sending.deliveries.len(), 3);

        let sent = wait_for_state(&h.handle, AlertState::Sent).await;
        assert!(sent.deliveries.iter().all(|d| d.status == DeliveryStatus::Sent));
        assert_eq!(h.channel.call_count(), 0);

        wait_for_state(&h.handle, AlertState::Idle).await;
        assert_eq!(h.channel.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_failure_waits_for_connectivity() {
        let h = harness(1);
        h.handle.notify_connectivity(false).unwrap();
        h.channel
            .fail_next(&phone(1), DispatchFailure::Unreachable("network is down".to_string()));
        tap(&h.handle);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.channel.call_count(), 1);
        let view = h.handle.view();
        assert_eq!(view.state, AlertState::Sending);
        assert_eq!(view.deliveries[0].status, DeliveryStatus::Pending);

        // No timer-driven retry while offline
        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.channel.call_count(), 1);

        h.handle.notify_connectivity(true).unwrap();
        let view = wait_for_state(&h.handle, AlertState::Sent).await;
        assert_eq!(view.deliveries[0].status, DeliveryStatus::Sent);
        assert_eq!(h.channel.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sent_confirmation_resets_after_eight_seconds() {
        let h = harness(1);
        tap(&h.handle);
        wait_for_state(&h.handle, AlertState::Sent).await;

        // Busy while the confirmation shows
        tap(&h.handle);
        sleep(Duration::from_millis(7500)).await;
        assert_eq!(h.handle.view().state, AlertState::Sent);
        assert_eq!(h.channel.call_count(), 1);

        sleep(Duration::from_secs(1)).await;
        let view = h.handle.view();
        assert_eq!(view.state, AlertState::Idle);
        assert!(view.deliveries.is_empty());

        // Ready for the next alert
        tap(&h.handle);
        wait_for_state(&h.handle, AlertState::CountingDown).await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_during_countdown_is_ignored() {
        let h = harness(1);
        tap(&h.handle);
        sleep(Duration::from_millis(2500)).await;
        h.handle
            .trigger(TriggerSource::Manual, EmergencyType::Medical, "again")
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let view = h.handle.view();
        assert_eq!(view.countdown_remaining, Some(3));
        assert_eq!(view.emergency_type, Some(EmergencyType::Personal));

        wait_for_state(&h.handle, AlertState::Sent).await;
        assert_eq!(h.channel.call_count(), 1);
    }

    #[tokio::test]
    async fn engine_closed_after_shutdown() {
        let h = harness(1);
        h.handle.shutdown().unwrap();
        let handle = h.handle.clone();
        let task = {
            let mut h = h;
            std::mem::replace(&mut h.task, tokio::spawn(async {}))
        };
        task.await.unwrap();
        assert!(handle.cancel().is_err());
    }
}
