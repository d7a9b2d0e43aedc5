use anyhow::bail;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum WaitState {
    Pending,
    Set,
    Faulted,
    Aborted,
}

/// A one-shot wait object for handshake correlation: a caller blocks on [`WaitObject::wait`]
///  until the correlated peer response arrives ([`WaitObject::set`]), the session faults,
///  the channel aborts, or the timeout elapses.
///
/// Terminal transitions happen exactly once - once the object left `Pending`, every later
///  `set`/`fault`/`abort` is a no-op. This is what makes the unblock-all-waiters path of
///  the local-fault funnel idempotent.
pub struct WaitObject {
    state: watch::Sender<WaitState>,
}

impl Default for WaitObject {
    fn default() -> Self {
        WaitObject::new()
    }
}

impl WaitObject {
    pub fn new() -> WaitObject {
        let (state, _) = watch::channel(WaitState::Pending);
        WaitObject { state }
    }

    pub fn set(&self) {
        self.transition(WaitState::Set);
    }

    pub fn fault(&self) {
        self.transition(WaitState::Faulted);
    }

    pub fn abort(&self) {
        self.transition(WaitState::Aborted);
    }

    pub fn is_set(&self) -> bool {
        *self.state.borrow() == WaitState::Set
    }

    fn transition(&self, target: WaitState) {
        self.state.send_if_modified(|state| {
            if *state == WaitState::Pending {
                *state = target;
                true
            }
            else {
                false
            }
        });
    }

    pub async fn wait(&self, timeout: Duration) -> anyhow::Result<()> {
        let mut rx = self.state.subscribe();

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let state = *rx.borrow_and_update();
                if state != WaitState::Pending {
                    return state;
                }
                if rx.changed().await.is_err() {
                    // the owner was dropped - treat as an abort
                    return WaitState::Aborted;
                }
            }
        })
        .await;

        match outcome {
            Err(_) => bail!("timed out waiting for the peer's response"),
            Ok(WaitState::Set) => Ok(()),
            Ok(WaitState::Faulted) => bail!("the session faulted while waiting"),
            Ok(WaitState::Aborted) => bail!("the channel was aborted while waiting"),
            Ok(WaitState::Pending) => unreachable!(),
        }
    }
}
