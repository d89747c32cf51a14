//! Sequencer runs on simulated actuators and tokio's paused clock.

mod common;

use beamline_ctl::counter::ManualCounter;
use beamline_ctl::hardware::ChannelArbiter;
use beamline_ctl::sequencer::positions::{build_steps, load_positions, Selection};
use beamline_ctl::sequencer::{Axis, Motion};
use beamline_ctl::{
    ControlError, SequenceOutcome, SequenceState, SequenceStatus, SequenceStep, SetpointLimits,
    StepSequencer, TriggerGate, TriggerSpec,
};
use common::{
    assert_duration_near, magnet_mock, secs, step, stepper_mock, transitions, TimingTolerance,
};
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn magnet_limits() -> SetpointLimits {
    SetpointLimits::new(0.0, 120.0, "A")
}

fn stepper_limits() -> SetpointLimits {
    SetpointLimits::new(-50_000.0, 50_000.0, "counts")
}

#[tokio::test(start_paused = true)]
async fn file_count_dwell_then_fresh_timer() {
    let mock = magnet_mock();
    let counter = ManualCounter::new(100);
    let gate = TriggerGate::new(Duration::from_secs(1)).with_counter(Arc::new(counter.clone()));
    let sequencer = StepSequencer::new(
        ChannelArbiter::new(mock.clone()),
        Axis::magnet_current(magnet_limits(), 60.0),
        gate,
    );

    let mut handle = sequencer
        .run(&[
            step("low", 10.0, TriggerSpec::EventCount(5)),
            step("high", 20.0, secs(3)),
        ])
        .unwrap();
    let mut status = handle.take_status_stream().unwrap();

    let mut seen: Vec<(Instant, SequenceStatus)> = Vec::new();
    let mut feeding = false;
    while let Some(s) = status.recv().await {
        if s.state == SequenceState::Dwelling && s.step_index == Some(0) && !feeding {
            feeding = true;
            let counter = counter.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(2500)).await;
                counter.advance(3);
                sleep(Duration::from_secs(1)).await;
                counter.advance(2);
            });
        }
        seen.push((Instant::now(), s));
    }
    assert_eq!(handle.wait().await.unwrap(), SequenceOutcome::Complete);

    let first = |state: SequenceState, index: Option<usize>| {
        seen.iter()
            .find(|(_, s)| s.state == state && s.step_index == index)
            .map(|(t, _)| *t)
            .unwrap()
    };
    let low_dwell = first(SequenceState::Dwelling, Some(0));
    let high_dwell = first(SequenceState::Dwelling, Some(1));
    let complete = first(SequenceState::Complete, None);

    assert_duration_near(
        high_dwell - low_dwell,
        Duration::from_secs(4),
        TimingTolerance::Exact,
        "five files counted from the entry baseline",
    );
    assert_duration_near(
        complete - high_dwell,
        Duration::from_secs(3),
        TimingTolerance::Exact,
        "timer starts when the dwell starts",
    );

    let details: Vec<&str> = seen.iter().map(|(_, s)| s.detail.as_str()).collect();
    assert!(details.contains(&"Waiting for 5 files... (3/5), next: high"), "{details:?}");
    assert_eq!(mock.written_values("sour:curr"), vec![10.0, 20.0]);
}

#[tokio::test(start_paused = true)]
async fn three_steps_report_in_order() {
    let mock = stepper_mock(1000.0);
    let sequencer = StepSequencer::new(
        ChannelArbiter::new(mock.clone()),
        Axis::copley_stepper(stepper_limits()),
        TriggerGate::new(Duration::from_secs(1)),
    );

    let mut handle = sequencer
        .run(&[
            step("a", 1000.0, secs(2)),
            step("b", -1000.0, secs(2)),
            step("c", 0.0, secs(2)),
        ])
        .unwrap();
    let mut status = handle.take_status_stream().unwrap();
    let mut all = Vec::new();
    while let Some(s) = status.recv().await {
        all.push(s);
    }

    assert_eq!(handle.wait().await.unwrap(), SequenceOutcome::Complete);
    assert_eq!(
        transitions(&all),
        vec![
            (SequenceState::Moving, Some(0)),
            (SequenceState::Dwelling, Some(0)),
            (SequenceState::Moving, Some(1)),
            (SequenceState::Dwelling, Some(1)),
            (SequenceState::Moving, Some(2)),
            (SequenceState::Dwelling, Some(2)),
            (SequenceState::Complete, None),
        ]
    );
    assert_eq!(
        mock.written_values("r0xca"),
        vec![1000.0, -1000.0, 0.0]
    );
    assert_eq!(mock.written_values("t"), vec![1.0, 1.0, 1.0]);
}

#[tokio::test(start_paused = true)]
async fn cyclic_switcher_runs_until_stopped_and_zeroes_supply() {
    let mock = magnet_mock();
    let counter = ManualCounter::new(0);
    let feeder = {
        let counter = counter.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;
                counter.advance(1);
            }
        })
    };
    let sequencer = StepSequencer::new(
        ChannelArbiter::new(mock.clone()),
        Axis::magnet_current(magnet_limits(), 45.0),
        TriggerGate::new(Duration::from_secs(1)).with_counter(Arc::new(counter)),
    );

    let mut handle = sequencer
        .run_cyclic(&[
            step("10 A", 10.0, TriggerSpec::EventCount(2)),
            step("20 A", 20.0, TriggerSpec::EventCount(2)),
        ])
        .unwrap();
    let mut status = handle.take_status_stream().unwrap();

    let mut all = Vec::new();
    while let Some(s) = status.recv().await {
        let second_cycle = s.detail.starts_with("[cycle 2]");
        all.push(s);
        if second_cycle {
            break;
        }
    }
    handle.stop();
    let outcome = handle.wait().await.unwrap();
    while let Some(s) = status.recv().await {
        all.push(s);
    }
    feeder.abort();

    let SequenceOutcome::Aborted { error, .. } = outcome else {
        panic!("cyclic run cannot complete, got {outcome:?}");
    };
    assert_eq!(error, ControlError::Cancelled);
    assert!(all.iter().all(|s| s.state != SequenceState::Complete));
    assert_eq!(all.last().map(|s| s.state), Some(SequenceState::Aborted));

    assert_eq!(&mock.written_values("sour:curr")[..3], &[10.0, 20.0, 10.0]);
    let writes: Vec<(String, f64)> = mock.writes().into_iter().map(|w| (w.id, w.value)).collect();
    assert_eq!(&writes[..2], &[
        ("sour:curr".to_string(), 10.0),
        ("sour:volt".to_string(), 45.0),
    ]);
    assert_eq!(
        &writes[writes.len() - 2..],
        &[("sour:curr".to_string(), 0.0), ("sour:volt".to_string(), 0.0)]
    );
}

#[tokio::test(start_paused = true)]
async fn positions_file_drives_stepper_with_offsets() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# wheel\nTarget A  1000\nBlank     2000  # empty holder").unwrap();
    let positions = load_positions(file.path()).unwrap();
    let selections: Vec<Selection> = ["Blank:-500:1s", "Target A:0:1s"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    let steps = build_steps(&positions, &selections).unwrap();

    let mock = stepper_mock(1000.0);
    let sequencer = StepSequencer::new(
        ChannelArbiter::new(mock.clone()),
        Axis::copley_stepper(stepper_limits()),
        TriggerGate::new(Duration::from_secs(1)),
    );
    let handle = sequencer.run(&steps).unwrap();

    assert_eq!(handle.wait().await.unwrap(), SequenceOutcome::Complete);
    assert_eq!(mock.written_values("r0xca"), vec![1500.0, 1000.0]);
}

#[tokio::test(start_paused = true)]
async fn stop_during_slow_stepper_move_halts_drive() {
    let mock = stepper_mock(100.0);
    let sequencer = StepSequencer::new(
        ChannelArbiter::new(mock.clone()),
        Axis::copley_stepper(stepper_limits()),
        TriggerGate::new(Duration::from_secs(1)),
    );
    let mut handle = sequencer
        .run(&[step("far", 5000.0, secs(1)), step("back", 0.0, secs(1))])
        .unwrap();
    let mut status = handle.take_status_stream().unwrap();

    sleep(Duration::from_millis(3500)).await;
    let stopped_at = Instant::now();
    handle.stop();
    let outcome = handle.wait().await.unwrap();

    assert!(
        stopped_at.elapsed() <= Duration::from_secs(1),
        "stop observed within one poll"
    );
    assert!(matches!(
        outcome,
        SequenceOutcome::Aborted {
            step: 0,
            error: ControlError::Cancelled,
            ..
        }
    ));
    assert_eq!(mock.written_values("t"), vec![1.0, 0.0]);
    assert_eq!(mock.written_values("r0xca"), vec![5000.0]);

    let mut all = Vec::new();
    while let Some(s) = status.recv().await {
        all.push(s);
    }
    assert_eq!(
        transitions(&all),
        vec![(SequenceState::Moving, Some(0)), (SequenceState::Aborted, Some(0))]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_during_ramped_step_ends_ramp_writes() {
    let mock = magnet_mock();
    let sequencer = StepSequencer::new(
        ChannelArbiter::new(mock.clone()),
        Axis::magnet_current(magnet_limits(), 60.0),
        TriggerGate::new(Duration::from_secs(1)),
    );
    let sweep = SequenceStep {
        label: "sweep".to_string(),
        target: 50.0,
        motion: Motion::Ramp {
            max_rate_per_second: 1.0,
        },
        trigger: secs(1),
    };
    let handle = sequencer.run(&[sweep]).unwrap();

    sleep(Duration::from_millis(3050)).await;
    let ramped = mock.written_values("sour:curr");
    assert_eq!(ramped.len(), 30, "one write per 100 ms tick");
    assert!((ramped[29] - 3.0).abs() < 1e-9);

    handle.stop();
    let outcome = handle.wait().await.unwrap();
    assert!(matches!(
        outcome,
        SequenceOutcome::Aborted {
            step: 0,
            error: ControlError::Cancelled,
            ..
        }
    ));

    // No ramp tick after the stop; only the zeroing stop command follows.
    let currents = mock.written_values("sour:curr");
    assert_eq!(currents.len(), ramped.len() + 1);
    assert_eq!(currents.last(), Some(&0.0));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.written_values("sour:curr").len(), currents.len());
    let writes: Vec<(String, f64)> = mock.writes().into_iter().map(|w| (w.id, w.value)).collect();
    assert_eq!(
        &writes[writes.len() - 2..],
        &[("sour:curr".to_string(), 0.0), ("sour:volt".to_string(), 0.0)]
    );
}
