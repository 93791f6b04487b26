use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const ROOM_QUEUE_CAPACITY: usize = 64;

struct RoomWorker {
    generation: u64,
    tx: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

/// One lazily created worker per room, each processing jobs strictly in
/// order: a second event for the same room waits until the first job
/// returns. Idle workers reap themselves after the grace period; a later
/// event just creates a fresh one.
pub struct RoomDispatcher {
    grace: Duration,
    workers: Arc<Mutex<HashMap<String, RoomWorker>>>,
    next_generation: Mutex<u64>,
}

impl RoomDispatcher {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
        }
    }

    pub async fn dispatch(&self, room_id: &str, job: Job) {
        let mut job = Some(job);
        loop {
            let tx = self.sender_for(room_id);
            match tx.send(job.take().expect("job present until sent")).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The worker reaped itself between lookup and send;
                    // retry against a fresh one.
                    job = Some(returned);
                    self.remove_closed(room_id);
                }
            }
        }
    }

    /// Drop all queue senders and wait for every in-flight job to finish.
    pub async fn drain(&self) {
        let drained: Vec<RoomWorker> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain().map(|(_, worker)| worker).collect()
        };
        for worker in drained {
            drop(worker.tx);
            if let Err(error) = worker.handle.await {
                if !error.is_cancelled() {
                    log::warn!("room worker ended abnormally: {error}");
                }
            }
        }
    }

    pub fn active_rooms(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn sender_for(&self, room_id: &str) -> mpsc::Sender<Job> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get(room_id) {
            if !worker.tx.is_closed() {
                return worker.tx.clone();
            }
        }

        let generation = {
            let mut next = self.next_generation.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        let (tx, rx) = mpsc::channel(ROOM_QUEUE_CAPACITY);
        let handle = spawn_worker(
            room_id.to_string(),
            generation,
            rx,
            self.grace,
            self.workers.clone(),
        );
        workers.insert(
            room_id.to_string(),
            RoomWorker {
                generation,
                tx: tx.clone(),
                handle,
            },
        );
        tx
    }

    fn remove_closed(&self, room_id: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.get(room_id).is_some_and(|w| w.tx.is_closed()) {
            workers.remove(room_id);
        }
    }
}

fn spawn_worker(
    room_id: String,
    generation: u64,
    mut rx: mpsc::Receiver<Job>,
    grace: Duration,
    workers: Arc<Mutex<HashMap<String, RoomWorker>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(grace, rx.recv()).await {
                Ok(Some(job)) => job.await,
                // Queue closed (drain) or idle past the grace period.
                Ok(None) => break,
                Err(_) => {
                    {
                        let mut workers_guard = workers.lock().unwrap_or_else(|e| e.into_inner());
                        if workers_guard
                            .get(&room_id)
                            .is_some_and(|w| w.generation == generation)
                        {
                            workers_guard.remove(&room_id);
                        }
                    }
                    rx.close();
                    // Finish anything that raced in before close.
                    while let Some(job) = rx.recv().await {
                        job.await;
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn jobs_for_one_room_run_in_order() {
        let dispatcher = RoomDispatcher::new(Duration::from_secs(60));
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            dispatcher
                .dispatch(
                    "!room",
                    Box::pin(async move {
                        // A later job finishing faster must still come later.
                        tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
                        log.lock().unwrap().push(i);
                    }),
                )
                .await;
        }
        dispatcher.drain().await;

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn one_in_flight_job_per_room() {
        let dispatcher = RoomDispatcher::new(Duration::from_secs(60));
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        for _ in 0..8 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            dispatcher
                .dispatch(
                    "!room",
                    Box::pin(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }),
                )
                .await;
        }
        dispatcher.drain().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rooms_run_independently() {
        let dispatcher = RoomDispatcher::new(Duration::from_secs(60));
        let gate = Arc::new(Notify::new());
        let fast_done = Arc::new(AtomicU32::new(0));

        let gate_clone = gate.clone();
        dispatcher
            .dispatch(
                "!slow",
                Box::pin(async move {
                    gate_clone.notified().await;
                }),
            )
            .await;

        let fast = fast_done.clone();
        dispatcher
            .dispatch(
                "!fast",
                Box::pin(async move {
                    fast.store(1, Ordering::SeqCst);
                }),
            )
            .await;

        // The fast room is not blocked behind the slow one.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fast_done.load(Ordering::SeqCst), 1);

        gate.notify_one();
        dispatcher.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_reap_themselves() {
        let dispatcher = RoomDispatcher::new(Duration::from_millis(50));
        dispatcher
            .dispatch("!room", Box::pin(async {}))
            .await;
        assert_eq!(dispatcher.active_rooms(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.active_rooms(), 0);

        // A new event lazily creates a fresh worker.
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = ran.clone();
        dispatcher
            .dispatch(
                "!room",
                Box::pin(async move {
                    ran_clone.store(1, Ordering::SeqCst);
                }),
            )
            .await;
        dispatcher.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_is_idempotent() {
        let dispatcher = RoomDispatcher::new(Duration::from_secs(60));
        dispatcher.dispatch("!room", Box::pin(async {})).await;
        dispatcher.drain().await;
        dispatcher.drain().await;
        assert_eq!(dispatcher.active_rooms(), 0);
    }
}
