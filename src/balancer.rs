use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::generator::Cancelled;

/// Counters from one run of the balancer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BalancerStats {
    /// Items handed over by the producer.
    pub produced: u64,

    /// Items passed to the evaluation function.
    pub evaluated: u64,

    /// Items the balancer moved between queues.
    pub rebalanced: u64,

    /// Items a worker took from another worker's queue after production finished.
    pub stolen: u64,
}

#[derive(Debug)]
pub enum BalancerError<E> {
    /// The first evaluation error. Everything else was stopped after it.
    Evaluation(E),

    Cancelled,
}

impl<E: fmt::Display> fmt::Display for BalancerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BalancerError::Evaluation(e) => write!(f, "evaluation failed: {}", e),
            BalancerError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BalancerError<E> {}

impl<E> From<Cancelled> for BalancerError<E> {
    fn from(_: Cancelled) -> Self {
        BalancerError::Cancelled
    }
}

/// Connects one producer to a fixed pool of workers.
/// Each worker owns a bounded queue. The producer fills the queues round-robin, while a
/// balancing thread moves items from backed-up queues to starving ones.
/// Items are evaluated in no particular order.
pub struct QueueBalancer {
    workers: usize,
    capacity: usize,
    interval: Duration,
}

// State shared by everything in one run.
struct Queues<T> {
    queues: Vec<Mutex<VecDeque<T>>>,
    capacity: usize,

    // Set by the producer when it returns.
    production_done: AtomicBool,

    // Set by the balancer after production is done and it has put back everything it holds.
    // Nothing gets pushed to a queue after this.
    balancer_done: AtomicBool,

    produced: AtomicU64,
    evaluated: AtomicU64,
    rebalanced: AtomicU64,
    stolen: AtomicU64,
}

impl<T> Queues<T> {
    fn new(workers: usize, capacity: usize) -> Queues<T> {
        Queues {
            queues: (0..workers)
                .map(|_| Mutex::new(VecDeque::with_capacity(capacity)))
                .collect(),
            capacity,
            production_done: AtomicBool::new(false),
            balancer_done: AtomicBool::new(false),
            produced: AtomicU64::new(0),
            evaluated: AtomicU64::new(0),
            rebalanced: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
        }
    }

    fn try_push(&self, index: usize, item: T) -> Result<(), T> {
        let mut queue = self.queues[index].lock();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        Ok(())
    }

    fn steal(&self, thief: usize) -> Option<T> {
        let n = self.queues.len();
        for offset in 1..n {
            let victim = (thief + offset) % n;
            if let Some(item) = self.queues[victim].lock().pop_back() {
                return Some(item);
            }
        }
        None
    }

    fn all_empty(&self) -> bool {
        self.queues.iter().all(|q| q.lock().is_empty())
    }

    // Moves about half of the fullest queue into the queues that are running low.
    fn rebalance(&self) {
        let high_water = (self.capacity * 3 / 4).max(1);
        let low_water = self.capacity / 4;

        let depths: Vec<usize> = self.queues.iter().map(|q| q.lock().len()).collect();
        let Some((fullest, &depth)) = depths.iter().enumerate().max_by_key(|(_, d)| **d) else {
            return;
        };
        if depth < high_water {
            return;
        }
        let starving: Vec<usize> = depths
            .iter()
            .enumerate()
            .filter(|(i, d)| *i != fullest && **d <= low_water)
            .map(|(i, _)| i)
            .collect();
        if starving.is_empty() {
            return;
        }

        let mut moving: Vec<T> = {
            let mut source = self.queues[fullest].lock();
            let keep = source.len() - source.len() / 2;
            source.drain(keep..).collect()
        };
        let mut moved = 0;
        let mut targets = starving.iter().cycle();
        let mut failures = 0;
        while let Some(item) = moving.pop() {
            let Some(&target) = targets.next() else {
                moving.push(item);
                break;
            };
            match self.try_push(target, item) {
                Ok(()) => {
                    moved += 1;
                    failures = 0;
                }
                Err(item) => {
                    moving.push(item);
                    failures += 1;
                    if failures >= starving.len() {
                        break;
                    }
                }
            }
        }
        if !moving.is_empty() {
            // The targets filled up in the meantime. Put the rest back.
            self.queues[fullest].lock().extend(moving);
        }
        if moved > 0 {
            trace!(from = fullest, moved, "rebalanced queues");
            self.rebalanced.fetch_add(moved, Ordering::Relaxed);
        }
    }
}

impl QueueBalancer {
    pub fn new(workers: usize, capacity: usize, interval: Duration) -> QueueBalancer {
        QueueBalancer {
            workers: workers.max(1),
            capacity: capacity.max(1),
            interval,
        }
    }

    /// Runs `produce` on the calling thread, feeding items to `evaluate` on the worker threads.
    /// The producer gets a push function and the token that stops the run. It should return
    /// promptly once the token is cancelled.
    ///
    /// The first evaluation error cancels everything and is returned.
    /// Cancelling `cancel` from outside stops the run with `BalancerError::Cancelled`.
    pub fn run<T, E, P, F>(
        &self,
        produce: P,
        evaluate: F,
        cancel: &CancellationToken,
    ) -> Result<BalancerStats, BalancerError<E>>
    where
        T: Send,
        E: Send,
        P: FnOnce(&mut dyn FnMut(T), &CancellationToken) -> Result<(), Cancelled>,
        F: Fn(T) -> Result<(), E> + Sync,
    {
        // Evaluation errors cancel this token, not the caller's.
        let stop = cancel.child_token();
        let shared = Queues::new(self.workers, self.capacity);
        let first_error: Mutex<Option<E>> = Mutex::new(None);

        let produced = std::thread::scope(|s| {
            for id in 0..self.workers {
                let shared = &shared;
                let stop = &stop;
                let evaluate = &evaluate;
                let first_error = &first_error;
                s.spawn(move || worker_loop(id, shared, stop, evaluate, first_error));
            }

            {
                let shared = &shared;
                let stop = &stop;
                let interval = self.interval;
                s.spawn(move || {
                    while !stop.is_cancelled() {
                        if shared.production_done.load(Ordering::Acquire) {
                            break;
                        }
                        std::thread::sleep(interval);
                        shared.rebalance();
                    }
                    shared.balancer_done.store(true, Ordering::Release);
                });
            }

            let result = {
                let mut next = 0;
                let mut push = |item: T| {
                    if push_item(&shared, &mut next, item, &stop) {
                        shared.produced.fetch_add(1, Ordering::Relaxed);
                    }
                };
                produce(&mut push, &stop)
            };
            shared.production_done.store(true, Ordering::Release);
            result
        });

        let stats = BalancerStats {
            produced: shared.produced.load(Ordering::Relaxed),
            evaluated: shared.evaluated.load(Ordering::Relaxed),
            rebalanced: shared.rebalanced.load(Ordering::Relaxed),
            stolen: shared.stolen.load(Ordering::Relaxed),
        };
        if let Some(e) = first_error.into_inner() {
            return Err(BalancerError::Evaluation(e));
        }
        if produced.is_err() || cancel.is_cancelled() {
            return Err(BalancerError::Cancelled);
        }
        debug!(
            produced = stats.produced,
            evaluated = stats.evaluated,
            rebalanced = stats.rebalanced,
            stolen = stats.stolen,
            "balancer finished"
        );
        Ok(stats)
    }
}

// Round-robin over the queues. When all of them are full, waits on a random one.
// Returns false if the item was dropped because the run got cancelled.
fn push_item<T>(shared: &Queues<T>, next: &mut usize, item: T, stop: &CancellationToken) -> bool {
    let n = shared.queues.len();
    let mut item = item;
    for _ in 0..n {
        let index = *next;
        *next = (*next + 1) % n;
        match shared.try_push(index, item) {
            Ok(()) => return true,
            Err(rejected) => item = rejected,
        }
    }

    let index = rand::thread_rng().gen_range(0..n);
    loop {
        if stop.is_cancelled() {
            return false;
        }
        match shared.try_push(index, item) {
            Ok(()) => return true,
            Err(rejected) => {
                item = rejected;
                std::thread::yield_now();
            }
        }
    }
}

fn worker_loop<T, E, F>(
    id: usize,
    shared: &Queues<T>,
    stop: &CancellationToken,
    evaluate: &F,
    first_error: &Mutex<Option<E>>,
) where
    F: Fn(T) -> Result<(), E>,
{
    loop {
        if stop.is_cancelled() {
            return;
        }
        let mut item = shared.queues[id].lock().pop_front();
        if item.is_none() && shared.balancer_done.load(Ordering::Acquire) {
            item = shared.steal(id);
            if item.is_some() {
                shared.stolen.fetch_add(1, Ordering::Relaxed);
            } else if shared.all_empty() {
                return;
            }
        }
        let Some(item) = item else {
            std::thread::yield_now();
            continue;
        };
        shared.evaluated.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = evaluate(item) {
            let mut slot = first_error.lock();
            if slot.is_none() {
                *slot = Some(e);
            }
            stop.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_every_item_is_evaluated_once() {
        let balancer = QueueBalancer::new(4, 8, Duration::from_millis(1));
        let seen = Mutex::new(vec![0u32; 10_000]);
        let stats = balancer
            .run(
                |push, _| {
                    for i in 0..10_000usize {
                        push(i);
                    }
                    Ok(())
                },
                |i: usize| -> Result<(), String> {
                    seen.lock()[i] += 1;
                    Ok(())
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(stats.produced, 10_000);
        assert_eq!(stats.evaluated, 10_000);
        assert!(seen.lock().iter().all(|count| *count == 1));
    }

    fn depths<T>(shared: &Queues<T>) -> Vec<usize> {
        shared.queues.iter().map(|q| q.lock().len()).collect()
    }

    #[test]
    fn test_rebalance_moves_half_of_the_fullest_queue() {
        let shared: Queues<usize> = Queues::new(3, 64);
        for i in 0..64 {
            shared.try_push(0, i).unwrap();
        }
        for i in 0..40 {
            shared.try_push(1, 100 + i).unwrap();
        }
        shared.rebalance();
        assert_eq!(depths(&shared), vec![32, 40, 32]);
        assert_eq!(shared.rebalanced.load(Ordering::Relaxed), 32);

        // The front of the fullest queue stays where it was.
        let kept: Vec<usize> = shared.queues[0].lock().iter().copied().collect();
        assert_eq!(kept, (0..32).collect::<Vec<_>>());
        let mut moved: Vec<usize> = shared.queues[2].lock().iter().copied().collect();
        moved.sort();
        assert_eq!(moved, (32..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_rebalance_leaves_balanced_queues_alone() {
        let shared: Queues<usize> = Queues::new(3, 64);
        for queue in 0..3 {
            for i in 0..40 {
                shared.try_push(queue, i).unwrap();
            }
        }
        shared.rebalance();
        assert_eq!(depths(&shared), vec![40, 40, 40]);
        assert_eq!(shared.rebalanced.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_idle_worker_steals_after_production() {
        // Item 0 goes to the first worker, which holds on to it until the other worker has
        // evaluated everything else, including what is left in the first worker's queue.
        let balancer = QueueBalancer::new(2, 64, Duration::from_millis(1));
        let others = AtomicUsize::new(0);
        let stats = balancer
            .run(
                |push, _| {
                    for i in 0..100usize {
                        push(i);
                    }
                    Ok(())
                },
                |i: usize| -> Result<(), String> {
                    if i == 0 {
                        let deadline = Instant::now() + Duration::from_secs(10);
                        while others.load(Ordering::Acquire) < 99 && Instant::now() < deadline {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    } else {
                        others.fetch_add(1, Ordering::Release);
                    }
                    Ok(())
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(stats.evaluated, 100);
        assert!(stats.stolen > 0);
    }

    #[test]
    fn test_slow_worker_gets_relieved() {
        let balancer = QueueBalancer::new(2, 64, Duration::from_millis(1));
        let total = AtomicUsize::new(0);
        let stats = balancer
            .run(
                |push, _| {
                    for i in 0..2_000usize {
                        push(i);
                    }
                    Ok(())
                },
                |i: usize| -> Result<(), String> {
                    if i % 2 == 0 {
                        std::thread::sleep(Duration::from_micros(20));
                    }
                    total.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 2_000);
        assert_eq!(stats.evaluated, 2_000);
    }

    #[test]
    fn test_first_error_stops_the_run() {
        let balancer = QueueBalancer::new(3, 4, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let result = balancer.run(
            |push, stop| {
                for i in 0..1_000_000u64 {
                    if stop.is_cancelled() {
                        return Err(Cancelled);
                    }
                    push(i);
                }
                Ok(())
            },
            |i: u64| {
                if i == 100 {
                    Err(format!("bad item {}", i))
                } else {
                    Ok(())
                }
            },
            &cancel,
        );
        match result {
            Err(BalancerError::Evaluation(message)) => assert_eq!(message, "bad item 100"),
            other => panic!("unexpected result: {:?}", other.map(|s| s.evaluated)),
        }
        // The caller's token is left alone.
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_external_cancellation() {
        let balancer = QueueBalancer::new(2, 4, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = balancer.run(
            |push, stop| {
                if stop.is_cancelled() {
                    return Err(Cancelled);
                }
                push(1u8);
                Ok(())
            },
            |_| -> Result<(), String> { Ok(()) },
            &cancel,
        );
        assert!(matches!(result, Err(BalancerError::Cancelled)));
    }
}
