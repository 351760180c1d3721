use std::collections::HashSet;
use std::io::ErrorKind;
use std::mem;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::client::Client;
use crate::connector::Connector;

/// One outbound buffer for one client. Holds its own client reference so
/// the socket stays open until the buffer is written or given up on.
struct SendJob {
    client: Arc<Client>,
    buf: Vec<u8>,
    ofs: usize,
}

impl SendJob {
    fn remaining(&self) -> usize {
        self.buf.len() - self.ofs
    }

    fn footprint(&self) -> usize {
        mem::size_of::<SendJob>() + self.remaining()
    }
}

enum WriteOutcome {
    Done,
    Blocked,
    Failed,
}

/// Intake side of the outbound path. Producers enqueue finished buffers;
/// the single sender task drains them with non-blocking writes so a stalled
/// client only ever delays its own traffic.
pub(crate) struct Sender {
    intake: Mutex<Vec<SendJob>>,
    notify: Notify,
    generated: AtomicI64,
    queued: AtomicI64,
    size: AtomicI64,
    delayed: AtomicI64,
}

impl Sender {
    pub(crate) fn new() -> Self {
        Self {
            intake: Mutex::new(Vec::new()),
            notify: Notify::new(),
            generated: AtomicI64::new(0),
            queued: AtomicI64::new(0),
            size: AtomicI64::new(0),
            delayed: AtomicI64::new(0),
        }
    }

    /// Queue a buffer for a client the caller has already referenced.
    pub(crate) fn enqueue(&self, client: Arc<Client>, buf: Vec<u8>) {
        if buf.is_empty() {
            warn!("connector asked to send an empty buffer to client {}", client.id());
            return;
        }
        self.generated.fetch_add(1, Ordering::Relaxed);
        self.intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SendJob { client, buf, ofs: 0 });
        self.notify.notify_one();
    }

    fn take_intake(&self) -> Vec<SendJob> {
        mem::take(&mut *self.intake.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn intake_is_empty(&self) -> bool {
        self.intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Count and rough memory footprint of jobs awaiting pickup.
    pub(crate) fn intake_snapshot(&self) -> (usize, usize) {
        let intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        let memory = intake.iter().map(SendJob::footprint).sum();
        (intake.len(), memory)
    }

    pub(crate) fn generated(&self) -> i64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub(crate) fn queued(&self) -> i64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn size(&self) -> i64 {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn delayed(&self) -> i64 {
        self.delayed.load(Ordering::Relaxed)
    }
}

/// Write as much of one job as the socket will take right now.
fn write_job(job: &mut SendJob) -> WriteOutcome {
    if job.client.is_invalid() {
        return WriteOutcome::Done;
    }
    while job.remaining() > 0 {
        match job.client.stream().try_write(&job.buf[job.ofs..]) {
            Ok(0) => return WriteOutcome::Blocked,
            Ok(n) => job.ofs += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return WriteOutcome::Blocked,
            Err(e) => {
                info!(
                    "client {} fd {} disconnected on write: {}",
                    job.client.id(),
                    job.client.raw_fd(),
                    e
                );
                return WriteOutcome::Failed;
            }
        }
    }
    WriteOutcome::Done
}

/// The sender task. Sweeps the working list, keeps partially written jobs
/// with their offsets and polls for new intake every 10ms when idle.
pub(crate) async fn run(connector: Arc<Connector>) {
    let sender = connector.sender();
    let mut sends: Vec<SendJob> = Vec::new();

    loop {
        // A client whose earlier job is still blocked must not have a later
        // job written around it.
        let mut stalled: HashSet<i64> = HashSet::new();
        let mut kept: Vec<SendJob> = Vec::with_capacity(sends.len());
        let mut queued = 0i64;
        let mut size = 0i64;

        for mut job in sends.drain(..) {
            if stalled.contains(&job.client.id()) {
                queued += 1;
                size += job.footprint() as i64;
                kept.push(job);
                continue;
            }
            match write_job(&mut job) {
                WriteOutcome::Done => {
                    metrics::counter!("connector_sends_complete_total").increment(1);
                }
                WriteOutcome::Blocked => {
                    stalled.insert(job.client.id());
                    queued += 1;
                    size += job.footprint() as i64;
                    kept.push(job);
                }
                WriteOutcome::Failed => {
                    connector.drop_client(&job.client).await;
                }
            }
        }
        sends = kept;

        sender.queued.store(queued, Ordering::Relaxed);
        sender.size.store(size, Ordering::Relaxed);
        sender.delayed.fetch_add(queued, Ordering::Relaxed);

        if connector.shutdown_requested() {
            break;
        }

        if sender.intake_is_empty() {
            let _ = tokio::time::timeout(Duration::from_millis(10), sender.notify.notified()).await;
        }
        sends.append(&mut sender.take_intake());
    }
}
