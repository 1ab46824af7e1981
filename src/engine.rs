use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::identity::ParticipantKey;
use crate::ledger::{TallySnapshot, VoteLedger};
use crate::policy::PollDefinition;
use crate::presence::{PresenceConfig, PresenceTracker};
use crate::sse::models::{PresenceKind, PresenceSignal, VoteChange};
use crate::store::{StoredVote, VoteStore};

/// Seed a ledger from snapshot rows. Malformed rows are dropped and logged,
/// never applied.
fn seed_ledger(ledger: &mut VoteLedger, rows: Vec<StoredVote>) {
    for row in rows {
        let event = match VoteChange::Inserted(row).into_event() {
            Ok(event) => event,
            Err(error) => {
                warn!("dropping malformed vote row from snapshot: {error}");
                continue;
            }
        };
        if let Err(error) = ledger.apply(event) {
            warn!("dropping malformed vote row from snapshot: {error}");
        }
    }
}

pub(crate) fn ledger_from_rows(option_count: usize, rows: Vec<StoredVote>) -> VoteLedger {
    let mut ledger = VoteLedger::new(option_count);
    seed_ledger(&mut ledger, rows);
    ledger
}

fn selection_vec(ledger: &VoteLedger, me: &ParticipantKey) -> Option<Vec<u32>> {
    ledger
        .selection_of(me)
        .map(|selected| selected.iter().map(|&i| i as u32).collect())
}

/// Handle to a running poll session. Dropping it stops the session task and
/// detaches from both the mutation and presence streams; state applied up to
/// that point is simply discarded with the ledger.
pub struct SessionHandle {
    tallies: watch::Receiver<TallySnapshot>,
    viewers: watch::Receiver<usize>,
    my_selection: watch::Receiver<Option<Vec<u32>>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn tallies(&self) -> watch::Receiver<TallySnapshot> {
        self.tallies.clone()
    }

    pub fn viewers(&self) -> watch::Receiver<usize> {
        self.viewers.clone()
    }

    pub fn my_selection(&self) -> watch::Receiver<Option<Vec<u32>>> {
        self.my_selection.clone()
    }

    pub fn stop(self) {}
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One poll viewing session: owns its ledger, tally snapshots, and presence
/// set exclusively. Concurrent views of the same poll each run their own
/// session; sessions never share mutable state.
pub struct PollSession;

impl PollSession {
    /// Seed the ledger from a store snapshot, then serve the already-attached
    /// live subscriptions. The caller subscribes both receivers *before*
    /// calling this, so events racing the snapshot fetch sit buffered in the
    /// channel and reconcile with the seeded rows purely by write sequence,
    /// whichever side is applied first.
    pub async fn start<S>(
        store: Arc<S>,
        poll: PollDefinition,
        me: ParticipantKey,
        changes: broadcast::Receiver<VoteChange>,
        presence: broadcast::Receiver<PresenceSignal>,
        presence_config: PresenceConfig,
    ) -> Result<SessionHandle, EngineError>
    where
        S: VoteStore + 'static,
    {
        let mut ledger = VoteLedger::new(poll.option_count());
        let rows = store.fetch_all_votes(poll.id).await?;
        seed_ledger(&mut ledger, rows);

        let (tally_tx, tally_rx) = watch::channel(ledger.tally());
        let (viewers_tx, viewers_rx) = watch::channel(0);
        let (selection_tx, selection_rx) = watch::channel(selection_vec(&ledger, &me));

        let worker = SessionWorker {
            store,
            poll,
            me,
            ledger,
            tracker: PresenceTracker::new(presence_config.clone()),
            presence_config,
            changes,
            presence,
            tally_tx,
            viewers_tx,
            selection_tx,
        };

        let task = tokio::spawn(async move {
            if let Err(error) = worker.run().await {
                debug!("poll session ended: {error}");
            }
        });

        Ok(SessionHandle {
            tallies: tally_rx,
            viewers: viewers_rx,
            my_selection: selection_rx,
            task,
        })
    }
}

struct SessionWorker<S> {
    store: Arc<S>,
    poll: PollDefinition,
    me: ParticipantKey,
    ledger: VoteLedger,
    tracker: PresenceTracker,
    presence_config: PresenceConfig,
    changes: broadcast::Receiver<VoteChange>,
    presence: broadcast::Receiver<PresenceSignal>,
    tally_tx: watch::Sender<TallySnapshot>,
    viewers_tx: watch::Sender<usize>,
    selection_tx: watch::Sender<Option<Vec<u32>>>,
}

impl<S: VoteStore> SessionWorker<S> {
    /// Single consumer loop: all mutation application against this ledger is
    /// serialized here, which is what preserves last-writer-wins without any
    /// locking.
    async fn run(mut self) -> Result<(), EngineError> {
        let prune_period = (self.presence_config.heartbeat_timeout / 2).max(Duration::from_secs(1));
        let mut prune = tokio::time::interval(prune_period);

        loop {
            tokio::select! {
                change = self.changes.recv() => match change {
                    Ok(change) => {
                        if change.poll_id() != self.poll.id {
                            continue;
                        }
                        self.apply_change(change);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(poll_id = %self.poll.id, skipped, "live event stream lagged, resyncing from snapshot");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::TransportDisconnected);
                    }
                },
                signal = self.presence.recv() => match signal {
                    Ok(signal) if signal.poll_id == self.poll.id => {
                        match signal.kind {
                            PresenceKind::Join => self.tracker.join(&signal.connection_id),
                            PresenceKind::Heartbeat => self.tracker.heartbeat(&signal.connection_id),
                            PresenceKind::Leave => self.tracker.leave(&signal.connection_id),
                        }
                        let _ = self.viewers_tx.send(self.tracker.current_count());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Dropped presence signals are repaired by heartbeats.
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::TransportDisconnected);
                    }
                },
                _ = prune.tick() => {
                    let _ = self.viewers_tx.send(self.tracker.current_count());
                }
            }
        }
    }

    fn apply_change(&mut self, change: VoteChange) {
        let event = match change.into_event() {
            Ok(event) => event,
            Err(error) => {
                warn!(poll_id = %self.poll.id, "dropping malformed vote event: {error}");
                return;
            }
        };

        match self.ledger.apply(event) {
            Ok(true) => self.publish(),
            Ok(false) => {
                // Stale or duplicate delivery, discarded by design.
            }
            Err(error) => {
                warn!(poll_id = %self.poll.id, "dropping malformed vote event: {error}");
            }
        }
    }

    fn publish(&self) {
        let _ = self.tally_tx.send(self.ledger.tally());
        let _ = self.selection_tx.send(selection_vec(&self.ledger, &self.me));
    }

    /// Events were lost, so incremental application is no longer sound:
    /// refetch the snapshot and replace the ledger wholesale before resuming.
    async fn resync(&mut self) {
        match self.store.fetch_all_votes(self.poll.id).await {
            Ok(rows) => {
                self.ledger.reset();
                seed_ledger(&mut self.ledger, rows);
                self.publish();
            }
            Err(error) => {
                warn!(poll_id = %self.poll.id, "snapshot refetch failed, tallies stay stale until the next resync: {error}");
            }
        }
    }
}
