//! End-to-end poll engine scenarios against the simulated sensor.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use tevaa::{
    Channel, ConnectionState, Event, RegisterEntry, RegisterKind, RegisterMap, SensorController,
};

use ConnectionState::*;

/// Scalar reads: 5 answered, then `silent` unanswered, then answered again.
fn outage_script(silent: usize) -> Script {
    Box::new(move |_, index| {
        if (5..5 + silent).contains(&index) {
            Reply::Silent
        } else {
            Reply::Normal
        }
    })
}

#[test]
fn silence_degrades_then_recovers() {
    // Ten silent cycles at three attempts each.
    let (transport, sim) = SimSensor::new(outage_script(30));
    let mut sensor = SensorController::new(poll(10, 3, 12), RegisterMap::default());
    let events = sensor.events();
    sensor.connect_with(link(20, 3), transport).unwrap();

    let seen = collect_until(&events, Duration::from_secs(10), |e| {
        matches!(e, Event::Reading(r) if r.sequence >= 7)
    });
    sensor.disconnect();

    assert_eq!(states(&seen), vec![Connecting, Connected, Degraded, Connected]);

    let degraded_at = seen.iter().position(|e| is_state(e, Degraded)).unwrap();
    let before: Vec<u64> = readings(&seen[..degraded_at]).iter().map(|r| r.sequence).collect();
    assert_eq!(before, vec![1, 2, 3, 4, 5]);

    let after = readings(&seen[degraded_at..]);
    assert_eq!(after.first().map(|r| r.sequence), Some(6));
    assert!(after.iter().all(|r| r.tev == 35.0 && r.aa == 48.0));
    assert_eq!(after[0].extra("tev_discharge_count"), Some(12.0));

    let all = readings(&seen);
    assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(sim.is_dropped());
}

#[test]
fn prolonged_silence_fails_and_stops_polling() {
    let (transport, sim) = SimSensor::new(outage_script(usize::MAX / 2));
    let mut sensor = SensorController::new(poll(5, 3, 8), RegisterMap::default());
    let events = sensor.events();
    sensor.connect_with(link(20, 3), transport).unwrap();

    let seen = collect_until(&events, Duration::from_secs(10), |e| is_state(e, Failed));
    assert_eq!(states(&seen), vec![Connecting, Connected, Degraded, Failed]);
    assert_eq!(readings(&seen).len(), 5);

    // Five good requests plus eight failed cycles of three attempts.
    thread::sleep(Duration::from_millis(100));
    let count = sim.request_count();
    assert_eq!(count, 5 + 8 * 3);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(sim.request_count(), count);
    assert!(sim.is_dropped());
    assert!(!sensor.is_active());

    let stats = sensor.stats().unwrap();
    assert_eq!(stats.cycles_failed, 8);
    assert_eq!(stats.timeouts, 24);

    sensor.disconnect();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)),
        Ok(Event::StateChanged {
            old: Failed,
            new: Disconnected
        })
    );
}

#[test]
fn disconnect_during_read_returns_within_one_timeout() {
    let (transport, sim) = SimSensor::new(Box::new(|_, index| {
        if index == 0 {
            Reply::Normal
        } else {
            Reply::Silent
        }
    }));
    let mut sensor = SensorController::new(poll(1, 3, 10), RegisterMap::default());
    let events = sensor.events();
    sensor.connect_with(link(400, 3), transport).unwrap();

    collect_until(&events, Duration::from_secs(5), |e| matches!(e, Event::Reading(_)));
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    sensor.disconnect();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(800), "disconnect took {elapsed:?}");

    assert!(sim.is_dropped());
    let count = sim.request_count();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(sim.request_count(), count);

    let rest = events.drain();
    assert!(matches!(
        rest.last(),
        Some(Event::StateChanged {
            new: Disconnected,
            ..
        })
    ));
    // Idempotent.
    sensor.disconnect();
    assert!(events.try_recv().is_none());
}

fn long_tev_map() -> RegisterMap {
    let mut map = RegisterMap::default();
    for entry in &mut map.entries {
        if let RegisterKind::Waveform {
            channel: Channel::Tev,
            samples,
        } = &mut entry.kind
        {
            *samples = 200;
        }
    }
    map
}

#[test]
fn short_waveform_block_never_reaches_a_reading() {
    let short = Arc::new(AtomicBool::new(false));
    let flag = short.clone();
    // A 200-register block is read as 125 + 75; the second chunk comes back one short.
    let (transport, _sim) = SimSensor::new(Box::new(move |request, _| {
        if flag.load(Ordering::SeqCst) && request.address == 325 {
            Reply::Short(1)
        } else {
            Reply::Normal
        }
    }));
    let mut settings = poll(10, 2, 1000);
    settings.waveform_subrate = 1;
    let mut sensor = SensorController::new(settings, long_tev_map());
    let events = sensor.events();
    sensor.connect_with(link(20, 2), transport).unwrap();

    let healthy = collect_until(&events, Duration::from_secs(5), |e| {
        matches!(e, Event::Reading(r) if r.sequence >= 2)
    });
    let first = readings(&healthy)[0].clone();
    let tev = first.waveform(Channel::Tev).unwrap();
    assert!(first.is_waveform_fresh(Channel::Tev));
    assert_eq!(tev.len(), 200);
    let expected: Vec<i16> = (200..400).map(|a| common::register_value(a) as i16).collect();
    assert_eq!(tev.samples, expected);
    assert_eq!(first.waveform(Channel::Aa).map(|w| w.len()), Some(100));

    short.store(true, Ordering::SeqCst);
    let failing = collect_until(&events, Duration::from_secs(5), |e| is_state(e, Degraded));
    assert_eq!(states(&failing), vec![Degraded]);
    // At most the cycle already in flight when the sensor started misbehaving.
    assert!(readings(&failing).len() <= 1);
    assert!(readings(&failing)
        .iter()
        .all(|r| r.waveform(Channel::Tev).map(|w| w.len()) == Some(200)));
    let stats = sensor.stats().unwrap();
    assert!(stats.decode_errors >= 4, "{stats:?}");

    short.store(false, Ordering::SeqCst);
    let recovered = collect_until(&events, Duration::from_secs(5), |e| matches!(e, Event::Reading(_)));
    assert_eq!(states(&recovered), vec![Connected]);
    let reading = readings(&recovered)[0];
    assert!(reading.is_waveform_fresh(Channel::Tev));
    assert_eq!(reading.waveform(Channel::Tev).unwrap().len(), 200);
}

#[test]
fn waveforms_are_carried_forward_between_subrate_cycles() {
    let (transport, sim) = SimSensor::healthy();
    let mut settings = poll(20, 3, 10);
    settings.waveform_subrate = 3;
    let mut sensor = SensorController::new(settings, RegisterMap::default());
    let events = sensor.events();
    sensor.connect_with(link(50, 1), transport).unwrap();

    let seen = collect_until(&events, Duration::from_secs(5), |e| {
        matches!(e, Event::Reading(r) if r.sequence >= 4)
    });
    sensor.disconnect();

    let r = readings(&seen);
    assert_eq!(r.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert!(r[0].is_waveform_fresh(Channel::Tev) && r[0].is_waveform_fresh(Channel::Aa));
    for carried in &r[1..3] {
        assert!(!carried.is_waveform_fresh(Channel::Tev));
        assert!(Arc::ptr_eq(
            carried.tev_waveform.as_ref().unwrap(),
            r[0].tev_waveform.as_ref().unwrap()
        ));
    }
    assert!(r[3].is_waveform_fresh(Channel::Aa));
    assert!(r[3].aa_waveform.as_ref().unwrap().captured_at > r[0].timestamp);

    // Cycle 1 and 4 read scalars + both waveforms; cycles 2 and 3 scalars only.
    let addresses: Vec<u16> = sim.requests().iter().take(8).map(|r| r.address).collect();
    assert_eq!(addresses, vec![5002, 200, 300, 5002, 5002, 5002, 200, 300]);
}

#[test]
fn waveform_subrate_can_change_while_running() {
    let (transport, sim) = SimSensor::healthy();
    let mut settings = poll(10, 3, 10);
    settings.waveform_subrate = 1;
    let mut sensor = SensorController::new(settings, RegisterMap::default());
    let events = sensor.events();
    sensor.connect_with(link(50, 1), transport).unwrap();

    collect_until(&events, Duration::from_secs(5), |e| matches!(e, Event::Reading(_)));
    sensor.set_waveform_subrate(0);
    // Let any cycle already under way finish.
    collect_until(&events, Duration::from_secs(5), |e| {
        matches!(e, Event::Reading(r) if r.sequence >= 3)
    });
    let mark = sim.request_count();
    collect_until(&events, Duration::from_secs(5), |e| {
        matches!(e, Event::Reading(r) if r.sequence >= 6)
    });
    sensor.disconnect();

    let requests = sim.requests();
    let later = &requests[mark..];
    assert!(!later.is_empty());
    assert!(later.iter().all(|r| r.address == 5002));
}

#[test]
fn sensor_exceptions_count_as_cycle_failures() {
    let (transport, _sim) = SimSensor::new(Box::new(|_, _| Reply::Exception(0x02)));
    let mut sensor = SensorController::new(poll(5, 1, 2), RegisterMap::default());
    let events = sensor.events();
    sensor.connect_with(link(50, 2), transport).unwrap();

    let seen = collect_until(&events, Duration::from_secs(5), |e| is_state(e, Failed));
    assert_eq!(states(&seen), vec![Connecting, Failed]);
    assert!(readings(&seen).is_empty());

    let stats = sensor.stats().unwrap();
    assert_eq!(stats.sensor_exceptions, 4);
    assert_eq!(stats.cycles_failed, 2);
    assert_eq!(stats.responses, 0);
}

#[test]
fn corrupted_replies_are_retried_transparently() {
    let (transport, _sim) = SimSensor::new(Box::new(|_, index| {
        if index % 2 == 0 {
            Reply::CorruptCrc
        } else {
            Reply::Normal
        }
    }));
    let mut sensor = SensorController::new(poll(5, 1, 5), RegisterMap::default());
    let events = sensor.events();
    sensor.connect_with(link(50, 3), transport).unwrap();

    let seen = collect_until(&events, Duration::from_secs(5), |e| {
        matches!(e, Event::Reading(r) if r.sequence >= 5)
    });
    assert_eq!(states(&seen), vec![Connecting, Connected]);

    let stats = sensor.stats().unwrap();
    assert!(stats.checksum_errors >= 5, "{stats:?}");
    assert_eq!(stats.cycles_failed, 0);
    sensor.disconnect();
}

#[test]
fn wrong_slave_address_never_connects() {
    let (transport, sim) = SimSensor::healthy();
    let mut sensor = SensorController::new(poll(5, 1, 2), RegisterMap::default());
    let events = sensor.events();
    let mut config = link(20, 1);
    config.slave_address = 9;
    sensor.connect_with(config, transport).unwrap();

    let seen = collect_until(&events, Duration::from_secs(5), |e| is_state(e, Failed));
    assert_eq!(states(&seen), vec![Connecting, Failed]);
    assert!(sim.requests().iter().all(|r| r.slave == 9));
}

#[test]
fn reconnect_starts_a_fresh_session() {
    let mut sensor = SensorController::new(poll(5, 3, 10), RegisterMap::default());
    let events = sensor.events();

    let (first, first_sim) = SimSensor::healthy();
    sensor.connect_with(link(50, 1), first).unwrap();
    collect_until(&events, Duration::from_secs(5), |e| {
        matches!(e, Event::Reading(r) if r.sequence >= 2)
    });

    let (second, _second_sim) = SimSensor::healthy();
    sensor.connect_with(link(50, 1), second).unwrap();
    assert!(first_sim.is_dropped());

    // Readings of the first session may still be queued ahead of the state changes.
    let mut restarted = false;
    let seen = collect_until(&events, Duration::from_secs(5), |e| {
        if is_state(e, Connected) {
            restarted = true;
        }
        restarted && matches!(e, Event::Reading(_))
    });
    assert_eq!(states(&seen), vec![Disconnected, Connecting, Connected]);
    assert_eq!(readings(&seen).last().map(|r| r.sequence), Some(1));
    sensor.disconnect();
}

#[test]
fn invalid_register_map_is_rejected_at_connect() {
    let mut map = RegisterMap::default();
    map.entries.push(RegisterEntry {
        name: "tev_level".into(),
        address: 6000,
        kind: RegisterKind::Waveform {
            channel: Channel::Aa,
            samples: 10,
        },
    });
    let mut sensor = SensorController::new(poll(5, 3, 10), map);
    let events = sensor.events();
    let (transport, sim) = SimSensor::healthy();
    assert!(sensor.connect_with(link(50, 1), transport).is_err());
    assert!(sim.is_dropped());
    assert!(events.try_recv().is_none());
}
