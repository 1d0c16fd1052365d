// Each rank runs three threads:
//   the communicator (the calling thread) answers peers and forwards results,
//   the timer wakes the communicator up so it polls the transport,
//   the worker checks candidates.
// The worker never talks to the transport. When it runs out of positions it sets the
// awaiting flag, tells the communicator, and sleeps on the condition variable until the
// communicator has found more work or decided there is none.
use std::collections::BTreeSet;
use std::sync::mpsc::{channel, Receiver, Sender};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::collector::Collector;
use crate::config::DistributedConfig;
use crate::distributed::protocol::{Message, COORDINATOR, RANK_DONE};
use crate::distributed::transport::{Transport, TransportError};
use crate::distributed::workload::{static_split, ShuffledOrder, WorkloadSlice};
use crate::distributed::DistributedError;
use crate::kernel::formula::Formula;
use crate::proof::{ProofRef, RepresentativeTable};
use crate::schema_index::SchemaIndex;

/// A conclusion to be checked for schema redundancy.
#[derive(Clone, Debug)]
pub struct FilterCandidate {
    /// Where the proof sits in the representative table.
    pub proof: ProofRef,

    pub key: String,
    pub proof_length: u32,
    pub conclusion: Formula,
}

/// The data every rank loads for one length.
/// All ranks must hold the same candidates in the same order.
pub struct FilterJob {
    length: u32,
    index: SchemaIndex,
    candidates: Vec<FilterCandidate>,
}

impl FilterJob {
    pub fn new(length: u32, index: SchemaIndex, candidates: Vec<FilterCandidate>) -> FilterJob {
        FilterJob {
            length,
            index,
            candidates,
        }
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn candidates(&self) -> &[FilterCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> u64 {
        self.candidates.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Every representative of one length as a candidate, checked against all conclusions the
    /// collector has registered.
    pub fn for_length(collector: &Collector, length: u32) -> FilterJob {
        let table = collector.table();
        let candidates = collector
            .representatives(length)
            .into_iter()
            .enumerate()
            .filter_map(|(i, (proof, conclusion))| {
                let proof_ref = table.known_ref(length, i)?;
                debug_assert_eq!(table.resolve(proof_ref), Some(proof.as_str()));
                Some(FilterCandidate {
                    proof: proof_ref,
                    key: conclusion.key(),
                    proof_length: proof.len() as u32,
                    conclusion,
                })
            })
            .collect();
        FilterJob::new(length, collector.schema_index(), candidates)
    }

    /// The proofs and conclusions of the candidates that aren't redundant, in candidate order.
    pub fn survivors(
        &self,
        redundant: &BTreeSet<u64>,
        table: &RepresentativeTable,
    ) -> Vec<(String, Formula)> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| !redundant.contains(&(*i as u64)))
            .filter_map(|(_, c)| {
                let proof = table.resolve(c.proof)?;
                Some((proof.to_string(), c.conclusion.clone()))
            })
            .collect()
    }

    /// Whether the candidate at this index is an instance of another indexed conclusion.
    pub fn is_redundant(&self, index: u64) -> bool {
        match self.candidates.get(index as usize) {
            Some(c) => self
                .index
                .find_generalization(&c.conclusion, c.proof_length, &c.key)
                .is_some(),
            None => false,
        }
    }
}

enum Event {
    Tick,
    Redundant(u64),

    /// The worker has used up its positions and waits for more.
    WorkerIdle,

    WorkerDone,
}

#[derive(Default)]
struct WorkerWait {
    awaiting: bool,

    // No more work will come.
    finished: bool,
}

struct RankState {
    slice: Mutex<WorkloadSlice>,
    wait: Mutex<WorkerWait>,
    wake: Condvar,
}

impl RankState {
    fn resume_worker(&self, finished: bool) {
        let mut wait = self.wait.lock();
        wait.awaiting = false;
        wait.finished |= finished;
        self.wake.notify_all();
    }
}

/// Runs one rank of the distributed schema filter.
/// Returns the indices of every redundant candidate on the coordinator, and None on the
/// other ranks.
pub fn run_rank<T: Transport + ?Sized>(
    transport: &T,
    job: &FilterJob,
    config: &DistributedConfig,
    cancel: &CancellationToken,
) -> Result<Option<BTreeSet<u64>>, DistributedError> {
    let rank = transport.rank();
    let size = transport.size();
    let order = ShuffledOrder::new(job.len());
    let (first, end) = static_split(job.len(), size, rank);
    let state = RankState {
        slice: Mutex::new(WorkloadSlice::new(first, end, config)),
        wait: Mutex::new(WorkerWait::default()),
        wake: Condvar::new(),
    };
    info!(rank, size, first, end, "starting rank");

    if rank != COORDINATOR {
        transport.send(
            COORDINATOR,
            &Message::Handshake {
                candidates: job.len(),
                length: job.length(),
            },
        )?;
    }

    // Stops the timer and the worker when the communicator returns.
    let stop = cancel.child_token();
    let (events, inbox) = channel();

    std::thread::scope(|s| {
        {
            let events = events.clone();
            let stop = &stop;
            let interval = config.poll_interval;
            s.spawn(move || {
                while !stop.is_cancelled() {
                    std::thread::sleep(interval);
                    if events.send(Event::Tick).is_err() {
                        break;
                    }
                }
            });
        }

        {
            let events = events.clone();
            let state = &state;
            let order = &order;
            let stop = &stop;
            s.spawn(move || work(job, order, state, events, stop, config));
        }
        drop(events);

        let mut communicator = Communicator {
            transport,
            job,
            state: &state,
            rank,
            size,
            pending_responses: 0,
            best_offer: None,
            worker_done: false,
            completed_peers: 0,
            handshakes: 0,
            redundant: BTreeSet::new(),
        };
        let result = communicator.run(&inbox, cancel);
        stop.cancel();
        state.resume_worker(true);
        result
    })
}

fn work(
    job: &FilterJob,
    order: &ShuffledOrder,
    state: &RankState,
    events: Sender<Event>,
    stop: &CancellationToken,
    config: &DistributedConfig,
) {
    let mut checked: u64 = 0;
    loop {
        if stop.is_cancelled() {
            return;
        }
        let next = state.slice.lock().next_position();
        if let Some(position) = next {
            let Some(index) = order.index_at(position) else {
                continue;
            };
            checked += 1;
            if job.is_redundant(index) && events.send(Event::Redundant(index)).is_err() {
                return;
            }
            continue;
        }

        state.wait.lock().awaiting = true;
        if events.send(Event::WorkerIdle).is_err() {
            return;
        }
        let mut wait = state.wait.lock();
        while wait.awaiting && !stop.is_cancelled() {
            state.wake.wait_for(&mut wait, config.poll_interval);
        }
        if wait.finished {
            break;
        }
    }
    debug!(checked, "worker finished");
    let _ = events.send(Event::WorkerDone);
}

struct Communicator<'a, T: Transport + ?Sized> {
    transport: &'a T,
    job: &'a FilterJob,
    state: &'a RankState,
    rank: usize,
    size: usize,

    // Reservable responses still expected for the current query.
    pending_responses: usize,

    // The largest offer seen in the current query, or the range being attempted.
    best_offer: Option<(usize, u64, u64)>,

    worker_done: bool,

    // Only tracked on the coordinator.
    completed_peers: usize,
    handshakes: usize,
    redundant: BTreeSet<u64>,
}

impl<'a, T: Transport + ?Sized> Communicator<'a, T> {
    fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR
    }

    fn run(
        &mut self,
        events: &Receiver<Event>,
        cancel: &CancellationToken,
    ) -> Result<Option<BTreeSet<u64>>, DistributedError> {
        loop {
            loop {
                let received = match self.transport.try_recv() {
                    Ok(received) => received,
                    // A peer that got Terminate may close before this rank reads its own.
                    Err(TransportError::Disconnected(peer))
                        if !self.is_coordinator() && peer != COORDINATOR =>
                    {
                        debug!(rank = self.rank, peer, "peer disconnected");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let Some((from, message)) = received else {
                    break;
                };
                if let Some(done) = self.handle_message(from, message)? {
                    return Ok(done);
                }
            }
            if let Some(done) = self.check_complete()? {
                return Ok(done);
            }
            let Ok(event) = events.recv() else {
                return Err(DistributedError::Cancelled);
            };
            match event {
                Event::Tick => {
                    if cancel.is_cancelled() {
                        return Err(DistributedError::Cancelled);
                    }
                }
                Event::Redundant(index) => {
                    if self.is_coordinator() {
                        self.redundant.insert(index);
                    } else {
                        self.transport
                            .send(COORDINATOR, &Message::IndexDone(index))?;
                    }
                }
                Event::WorkerIdle => self.query_peers()?,
                Event::WorkerDone => {
                    self.worker_done = true;
                    if !self.is_coordinator() {
                        self.transport
                            .send(COORDINATOR, &Message::IndexDone(RANK_DONE))?;
                    }
                }
            }
        }
    }

    // Returns the final result once the coordinator has heard from everyone.
    fn check_complete(&mut self) -> Result<Option<Option<BTreeSet<u64>>>, DistributedError> {
        if !self.is_coordinator() || !self.worker_done || self.completed_peers + 1 < self.size {
            return Ok(None);
        }
        self.transport.broadcast(&Message::Terminate)?;
        info!(
            redundant = self.redundant.len(),
            handshakes = self.handshakes,
            "filter complete"
        );
        Ok(Some(Some(std::mem::take(&mut self.redundant))))
    }

    fn query_peers(&mut self) -> Result<(), DistributedError> {
        if self.size <= 1 {
            self.state.resume_worker(true);
            return Ok(());
        }
        self.pending_responses = self.size - 1;
        self.best_offer = None;
        self.transport.broadcast(&Message::ReservableRequest)?;
        Ok(())
    }

    fn handle_message(
        &mut self,
        from: usize,
        message: Message,
    ) -> Result<Option<Option<BTreeSet<u64>>>, DistributedError> {
        trace!(rank = self.rank, from, ?message, "received");
        match message {
            Message::Handshake { candidates, length } => {
                if !self.is_coordinator() {
                    return Err(DistributedError::Protocol(format!(
                        "handshake sent to rank {}",
                        self.rank
                    )));
                }
                if candidates != self.job.len() || length != self.job.length() {
                    let error = DistributedError::Mismatch {
                        rank: from,
                        expected: (self.job.len(), self.job.length()),
                        found: (candidates, length),
                    };
                    warn!(%error, "aborting");
                    self.transport.broadcast(&Message::Abort {
                        reason: error.to_string(),
                    })?;
                    return Err(error);
                }
                self.handshakes += 1;
            }
            Message::Abort { reason } => return Err(DistributedError::Aborted(reason)),
            Message::IndexDone(RANK_DONE) => {
                self.completed_peers += 1;
                debug!(from, completed = self.completed_peers, "rank done");
            }
            Message::IndexDone(index) => {
                self.redundant.insert(index);
            }
            Message::ReservableRequest => {
                let (first, end) = self.state.slice.lock().reservable();
                self.transport
                    .send(from, &Message::ReservableResponse { first, end })?;
            }
            Message::ReservableResponse { first, end } => {
                self.pending_responses = self.pending_responses.saturating_sub(1);
                let larger = match self.best_offer {
                    Some((_, f, e)) => end.saturating_sub(first) > e - f,
                    None => true,
                };
                if first < end && larger {
                    self.best_offer = Some((from, first, end));
                }
                if self.pending_responses == 0 {
                    match self.best_offer {
                        Some((owner, first, end)) => {
                            self.transport
                                .send(owner, &Message::ReservationAttempt { first, end })?;
                        }
                        None => {
                            debug!(rank = self.rank, "no work left anywhere");
                            self.state.resume_worker(true);
                        }
                    }
                }
            }
            Message::ReservationAttempt { first, end } => {
                let granted = self.state.slice.lock().grant(first, end);
                if granted {
                    debug!(rank = self.rank, to = from, first, end, "granted range");
                }
                self.transport
                    .send(from, &Message::ReservationResponse(granted))?;
            }
            Message::ReservationResponse(granted) => {
                let offer = self.best_offer.take();
                match (granted, offer) {
                    (true, Some((_, first, end))) => {
                        self.state.slice.lock().adopt(first, end);
                        self.state.resume_worker(false);
                    }
                    (true, None) => {
                        return Err(DistributedError::Protocol(
                            "reservation granted without an attempt".to_string(),
                        ))
                    }
                    // Someone else got it first. Look again.
                    (false, _) => self.query_peers()?,
                }
            }
            Message::Terminate => {
                if self.is_coordinator() {
                    return Err(DistributedError::Protocol(
                        "terminate sent to the coordinator".to_string(),
                    ));
                }
                return Ok(Some(None));
            }
        }
        Ok(None)
    }
}
