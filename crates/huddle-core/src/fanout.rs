use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Deliver(Job),
    Flush(oneshot::Sender<()>),
}

/// Serializes listener callbacks onto a single delivery task.
///
/// Jobs run one at a time in dispatch order, outside of any session lock,
/// so a listener may call back into the session without deadlocking.
/// A panicking listener is logged and does not stop delivery.
#[derive(Clone)]
pub struct Fanout {
    tx: mpsc::UnboundedSender<Message>,
}

impl Fanout {
    /// Spawn the delivery worker on the current tokio runtime.
    ///
    /// Like `tokio::spawn`, this panics when called outside a runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(rx));
        Self { tx }
    }

    /// Queue a job for the delivery worker.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Message::Deliver(Box::new(job))).is_err() {
            tracing::debug!("fanout worker stopped, dropping notification");
        }
    }

    /// Wait until every job dispatched before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Deliver(job) => {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                        tracing::error!("listener panicked: {}", panic_message(panic.as_ref()));
                    }
                }
                Message::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("fanout worker ended");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn jobs_run_in_dispatch_order() {
        let fanout = Fanout::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            fanout.dispatch(move || seen.lock().unwrap().push(i));
        }
        fanout.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_delivery() {
        let fanout = Fanout::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));

        fanout.dispatch(|| panic!("boom"));
        let s = seen.clone();
        fanout.dispatch(move || s.lock().unwrap().push("after"));
        fanout.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
