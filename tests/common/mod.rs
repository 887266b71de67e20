use std::{net::SocketAddr, sync::Mutex};

use cluster_messaging::message::ResponseCallback;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum Outcome<T> {
    Response(SocketAddr, T),
    Failure(SocketAddr),
}

/// A `ResponseCallback` for integration tests: forwards the first response or failure onto a
/// oneshot channel so the test can simply `.await` it.
pub struct OneShotCallback<T> {
    tx: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    wants_failure: bool,
}

impl<T: Send + 'static> OneShotCallback<T> {
    pub fn new(wants_failure: bool) -> (Self, oneshot::Receiver<Outcome<T>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
                wants_failure,
            },
            rx,
        )
    }
}

impl<T: Send + 'static> ResponseCallback<T> for OneShotCallback<T> {
    fn on_response(&self, from: SocketAddr, response: T) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(Outcome::Response(from, response));
        }
    }

    fn on_failure(&self, target: SocketAddr) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(Outcome::Failure(target));
        }
    }

    fn wants_failure_callback(&self) -> bool {
        self.wants_failure
    }
}
