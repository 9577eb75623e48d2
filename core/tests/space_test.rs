use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loom_kernel::event::types;
use loom_kernel::{
    Agent, ClusterDirectory, ContextId, Event, GuardEvaluator, KernelError, PerceptionGuards,
    Scope, SpaceDirectory, SpaceId,
};
use serde_json::json;
use tokio::sync::mpsc;

/// Counts handled events per type and forwards the ids.
struct Tally {
    pings: AtomicUsize,
    inits: AtomicUsize,
    seen: mpsc::UnboundedSender<Event>,
}

impl PerceptionGuards for Tally {
    fn guard_evaluators(self: Arc<Self>) -> Vec<GuardEvaluator> {
        let ping = self.clone();
        let init = self.clone();
        vec![
            GuardEvaluator::on("ping").then(move |e| {
                ping.pings.fetch_add(1, Ordering::SeqCst);
                let _ = ping.seen.send(e.clone());
                Ok(())
            }),
            GuardEvaluator::on(types::INITIALIZE).then(move |e| {
                init.inits.fetch_add(1, Ordering::SeqCst);
                let _ = init.seen.send(e.clone());
                Ok(())
            }),
        ]
    }
}

async fn agent_with_tally(name: &str) -> (Arc<Agent>, Arc<Tally>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let tally = Arc::new(Tally {
        pings: AtomicUsize::new(0),
        inits: AtomicUsize::new(0),
        seen: tx,
    });
    let agent = Agent::new(name);
    agent.dispatcher().register(&tally);
    agent.initialize(json!({})).await.unwrap();
    (agent, tally, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<Event> {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

fn directory_with_context() -> (SpaceDirectory, SpaceId) {
    let directory = SpaceDirectory::new(ClusterDirectory::in_memory(), None);
    let ctx = ContextId::new_v4();
    let default = SpaceId::random(ctx);
    directory.create_context(ctx, default.clone());
    (directory, default)
}

#[tokio::test]
async fn emitted_event_reaches_participant_once() {
    let (directory, default) = directory_with_context();
    let space = directory.space(&default).unwrap();
    let (x, tally, mut rx) = agent_with_tally("x").await;
    // drain the initialize marker
    assert!(recv(&mut rx).await.is_some());

    let a1 = x.join(&space).unwrap();
    let ev = Event::signal("ping");
    x.emit(&space, ev.clone(), Scope::All).unwrap();

    let got = recv(&mut rx).await.unwrap();
    assert_eq!(got.id, ev.id);
    assert_eq!(got.source, Some(a1));
    assert!(recv(&mut rx).await.is_none());
    assert_eq!(tally.pings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lifecycle_marker_from_space_uses_immediate_dispatch() {
    let (directory, default) = directory_with_context();
    let space = directory.space(&default).unwrap();
    let (x, tally, mut rx) = agent_with_tally("x").await;
    assert!(recv(&mut rx).await.is_some());
    x.join(&space).unwrap();

    let before = x.dispatcher().stats();
    x.emit(&space, Event::initialize(json!({"again": true})), Scope::All)
        .unwrap();
    let got = recv(&mut rx).await.unwrap();
    assert_eq!(got.payload["again"], json!(true));
    assert_eq!(tally.inits.load(Ordering::SeqCst), 2);

    // immediate dispatch never goes through the NEW buffer
    let after = x.dispatcher().stats();
    assert_eq!(after.buffered, before.buffered);
}

#[tokio::test]
async fn scoped_emit_skips_other_participants() {
    let (directory, default) = directory_with_context();
    let space = directory.space(&default).unwrap();
    let (x, x_tally, mut x_rx) = agent_with_tally("x").await;
    let (y, y_tally, mut y_rx) = agent_with_tally("y").await;
    recv(&mut x_rx).await;
    recv(&mut y_rx).await;

    let ax = x.join(&space).unwrap();
    y.join(&space).unwrap();
    y.emit(&space, Event::signal("ping"), Scope::addresses([ax]))
        .unwrap();

    assert!(recv(&mut x_rx).await.is_some());
    assert!(recv(&mut y_rx).await.is_none());
    assert_eq!(x_tally.pings.load(Ordering::SeqCst), 1);
    assert_eq!(y_tally.pings.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn join_then_leave_restores_membership() {
    let (directory, default) = directory_with_context();
    let space = directory.space(&default).unwrap();
    let (x, _tally, _rx) = agent_with_tally("x").await;

    let before = space.participant_count();
    x.join(&space).unwrap();
    assert_eq!(space.participant_count(), before + 1);
    assert!(matches!(
        x.join(&space),
        Err(KernelError::DuplicateParticipant { .. })
    ));
    x.leave(&space).unwrap();
    assert_eq!(space.participant_count(), before);
    assert!(matches!(
        x.leave(&space),
        Err(KernelError::NotAParticipant { .. })
    ));
}

#[tokio::test]
async fn scope_selects_exactly_the_matching_participants() {
    let (directory, default) = directory_with_context();
    let space = directory.space(&default).unwrap();

    let mut members = Vec::new();
    for i in 0..6 {
        let (agent, tally, rx) = agent_with_tally(&format!("p{i}")).await;
        let address = agent.join(&space).unwrap();
        members.push((agent, tally, rx, address));
    }
    for (_, _, rx, _) in members.iter_mut() {
        // initialize marker
        recv(rx).await;
    }

    let chosen: BTreeSet<_> = members
        .iter()
        .step_by(2)
        .map(|(_, _, _, address)| address.clone())
        .collect();
    let scope = Scope::AnyOf(vec![
        Scope::Addresses(chosen.clone()),
        Scope::participants([members[5].3.participant_id]),
    ]);
    let emitter = &members[0].0;
    emitter
        .emit(&space, Event::signal("ping"), scope.clone())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    for (_, tally, _, address) in &members {
        let expected = usize::from(scope.matches(address));
        assert_eq!(tally.pings.load(Ordering::SeqCst), expected, "{address}");
    }
}
