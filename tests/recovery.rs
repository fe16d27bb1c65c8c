//! Loss, duplication, and failover recovery scenarios.

mod common;

use common::{cluster, delivered_ids, drain, session};
use quill::machine::command::{Command, Message, Query, QueryResult};
use quill::replication::{EndpointId, SessionEvent};
use quill::{Action, CommandLog, SessionError};

const EPS: &[&str] = &["node-a", "node-b"];

#[test]
fn dropped_command_is_recovered_by_resend() {
    let cluster = cluster(EPS);
    let (mut session, mut events) = session(&cluster, "s1", EPS);

    cluster.faults().drop_next_commands(1);
    session.enqueue(Some(1), "m1").unwrap();
    assert!(drain(&mut session, &mut events).is_empty(), "command was lost");
    assert_eq!(session.pending_count(), 1);

    // The lost-command trigger resubmits the identical sequence.
    session.resend_stale();
    let actions = drain(&mut session, &mut events);
    assert!(actions.contains(&Action::Confirmed {
        correlations: vec![1]
    }));

    let (_, ready) = cluster
        .handle("probe")
        .local_query(&EndpointId::from("node-a"), Query::ReadyCount)
        .unwrap();
    assert_eq!(ready, QueryResult::Count(1));
}

#[test]
fn resending_an_applied_sequence_never_duplicates() {
    let cluster = cluster(EPS);
    let (mut session, mut events) = session(&cluster, "s1", EPS);
    session.enqueue(None, "m1").unwrap();
    drain(&mut session, &mut events);

    // Replay the exact same sequence straight at the log, twice.
    let log = cluster.handle("s1");
    for correlation in [10, 11] {
        log.pipeline_command(
            &EndpointId::from("node-a"),
            correlation,
            Command::Enqueue {
                sender: "s1".into(),
                sequence: Some(1),
                message: Message::new("m1"),
            },
        );
    }

    let (_, ready) = log
        .local_query(&EndpointId::from("node-a"), Query::ReadyCount)
        .unwrap();
    assert_eq!(ready, QueryResult::Count(1));
}

#[test]
fn dropped_delivery_is_recovered_by_gap_fetch() {
    let cluster = cluster(EPS);
    let (mut session, mut events) = session(&cluster, "s1", EPS);

    session.checkout_prefetch("c1").unwrap();
    drain(&mut session, &mut events);

    // First delivery event is lost in transport; the second arrives with a
    // counter gap and forces a repair query against the leader.
    cluster.faults().drop_next_deliveries(1);
    session.enqueue(None, "m1").unwrap();
    session.enqueue(None, "m2").unwrap();
    let actions = drain(&mut session, &mut events);

    let ids = delivered_ids(&actions);
    assert_eq!(ids, vec![1, 2], "both messages surface exactly once");
    assert_eq!(cluster.counters().snapshot().gap_repairs, 1);
}

#[test]
fn leader_failover_preserves_exactly_once_settlement() {
    let cluster = cluster(EPS);
    let (mut session, mut events) = session(&cluster, "s1", EPS);

    // m1: enqueue under a prefetch checkout, deliver, settle.
    session.checkout_prefetch("c1").unwrap();
    session.enqueue(Some(1), "m1").unwrap();
    let actions = drain(&mut session, &mut events);
    let m1 = delivered_ids(&actions);
    assert_eq!(m1.len(), 1);
    session.settle("c1", m1.clone()).unwrap();
    drain(&mut session, &mut events);

    // Stop the backing leader; the session must observe the change as an
    // event, not an error.
    cluster.stop(&EndpointId::from("node-a"));
    let actions = drain(&mut session, &mut events);
    assert!(actions.is_empty(), "leader change is a transient, not an error");
    assert_eq!(session.target_endpoint(), &EndpointId::from("node-b"));

    // m2 is accepted by the new leader and delivered without duplicating m1.
    session.enqueue(Some(2), "m2").unwrap();
    let actions = drain(&mut session, &mut events);
    assert!(actions.contains(&Action::Confirmed {
        correlations: vec![2]
    }));
    let ids = delivered_ids(&actions);
    assert_eq!(ids.len(), 1);
    assert_ne!(ids, m1);

    // The old leader coming back changes nothing for the session.
    cluster.restart(&EndpointId::from("node-a"));
    session.settle("c1", ids).unwrap();
    drain(&mut session, &mut events);
    let (_, checked_out) = cluster
        .handle("probe")
        .local_query(&EndpointId::from("node-b"), Query::CheckedOutCount)
        .unwrap();
    assert_eq!(checked_out, QueryResult::Count(0));
}

#[test]
fn commands_sent_while_leaderless_recover_on_restart() {
    let single = &["solo"];
    let cluster = cluster(single);
    let (mut session, mut events) = session(&cluster, "s1", single);

    cluster.stop(&EndpointId::from("solo"));
    session.enqueue(Some(7), "m1").unwrap();
    assert!(drain(&mut session, &mut events).is_empty());

    // Restart elects the endpoint again and notifies the session, which
    // resubmits everything pending.
    cluster.restart(&EndpointId::from("solo"));
    let actions = drain(&mut session, &mut events);
    assert!(actions.contains(&Action::Confirmed {
        correlations: vec![7]
    }));
}

#[test]
fn replayed_delivery_event_surfaces_nothing_the_second_time() {
    let cluster = cluster(EPS);
    let (mut session, mut events) = session(&cluster, "s1", EPS);

    session.checkout_prefetch("c1").unwrap();
    session.enqueue(None, "m1").unwrap();

    // Capture the raw delivery event, then force-feed it twice.
    let mut delivery = None;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::Delivery { .. }) {
            delivery = Some(event.clone());
        }
        session.handle_event(event).unwrap();
    }
    let delivery = delivery.expect("a delivery event");
    let replay = session.handle_event(delivery).unwrap();
    assert!(replay.is_empty(), "duplicate transport delivery is invisible");
}

#[test]
fn queue_deletion_ends_the_session_for_good() {
    let cluster = cluster(EPS);
    let (mut session, mut events) = session(&cluster, "s1", EPS);
    cluster.delete_queue();
    let actions = drain(&mut session, &mut events);
    assert_eq!(actions, vec![Action::Eol]);
    assert_eq!(session.enqueue(None, "m"), Err(SessionError::Ended));
}
