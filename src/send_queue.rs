use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{Error, Message, MessageStream, Result};

/// One enqueued outbound frame, waiting for the writer.
struct PendingSend {
    msg: Message,
    done: oneshot::Sender<Result<()>>,
    cancel: CancellationToken,
}

/// The outbound FIFO: frames are written to the stream in enqueue order by
/// a single active writer.
///
/// Senders enqueue and then try to become the writer by taking the binary
/// permit; whoever holds it drains the queue on a spawned task and releases
/// the permit once the queue runs dry. Completion slots are single-shot, so
/// a slot resolves exactly once: written, failed, or cancelled.
pub(crate) struct SendQueue {
    stream: Arc<dyn MessageStream>,
    queue: Mutex<VecDeque<PendingSend>>,
    writer: Arc<Semaphore>,
    // captured at connection time so senders need not run on a runtime thread
    runtime: tokio::runtime::Handle,
}

impl SendQueue {
    pub(crate) fn new(stream: Arc<dyn MessageStream>, runtime: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(Self {
            stream,
            queue: Mutex::new(VecDeque::new()),
            writer: Arc::new(Semaphore::new(1)),
            runtime,
        })
    }

    /// Enqueue `msg` and ensure a writer is active.
    ///
    /// The returned slot resolves once the frame has been written to the
    /// stream, the write failed, or `cancel` fired before the writer
    /// reached the frame.
    pub(crate) fn queue(
        self: &Arc<Self>,
        msg: Message,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<Result<()>> {
        let (done, slot) = oneshot::channel();
        self.queue.lock().push_back(PendingSend { msg, done, cancel });
        self.activate();

        slot
    }

    fn activate(self: &Arc<Self>) {
        if let Ok(permit) = self.writer.clone().try_acquire_owned() {
            let queue = self.clone();
            self.runtime.spawn(queue.drain(permit));
        }
    }

    async fn drain(self: Arc<Self>, permit: OwnedSemaphorePermit) {
        let mut permit = Some(permit);
        loop {
            let entry = self.queue.lock().pop_front();
            let entry = match entry {
                Some(entry) => entry,
                None => {
                    drop(permit.take());
                    // A sender that enqueued between the last pop and the
                    // permit release has lost the activation race; pick its
                    // work up here instead of exiting.
                    if self.queue.lock().is_empty() {
                        return;
                    }
                    match self.writer.clone().try_acquire_owned() {
                        Ok(p) => {
                            permit = Some(p);
                            continue;
                        }
                        Err(_) => return,
                    }
                }
            };

            if entry.cancel.is_cancelled() {
                let _ = entry.done.send(Err(Error::Cancelled));
                continue;
            }

            // The write itself does not observe the user token.
            let result = self.stream.send(&entry.msg).await.map_err(Error::Io);
            if let Err(result) = entry.done.send(result) {
                // fire-and-forget sender; surface the failure in the log
                if let Err(e) = result {
                    log::warn!("failed to send queued message: {}", e);
                }
            }
        }
    }
}
