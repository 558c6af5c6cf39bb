//! Ties the CA manager's lifecycle to leadership of the datacenter.

use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::CaManager;
use super::tasks;


//------------ CaLeader ------------------------------------------------------

/// Starts the CA background work when this server becomes leader and
/// stops it again when leadership is lost.
pub struct CaLeader {
    manager: Arc<CaManager>,
    term: Mutex<Option<LeaderTerm>>,
}

struct LeaderTerm {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CaLeader {
    pub fn new(manager: Arc<CaManager>) -> Self {
        CaLeader {
            manager,
            term: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<CaManager> {
        &self.manager
    }

    pub fn is_leader(&self) -> bool {
        self.term.lock().expect("poisoned lock").is_some()
    }

    /// Starts a leadership term.
    ///
    /// Tries to initialize the CA once right away. If that fails, the
    /// failure is logged and retried in the background: leadership itself
    /// never fails because of the CA.
    pub async fn establish_leadership(&self) {
        if self.is_leader() {
            return;
        }
        info!(
            "Establishing CA leadership in datacenter {}",
            self.manager.config().datacenter
        );

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        if let Err(e) = self.manager.initialize().await {
            warn!("CA initialization failed, retrying in the background: {e}");
            handles.push(tokio::spawn(tasks::initialize_loop(
                self.manager.clone(),
                cancel.clone(),
            )));
        }

        handles.push(tokio::spawn(tasks::renewal_loop(
            self.manager.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(tasks::prune_loop(
            self.manager.clone(),
            cancel.clone(),
        )));
        if !self.manager.config().is_primary() {
            handles.push(tokio::spawn(tasks::roots_watch_loop(
                self.manager.clone(),
                cancel.clone(),
            )));
        }

        *self.term.lock().expect("poisoned lock") = Some(LeaderTerm {
            cancel,
            tasks: handles,
        });
    }

    /// Ends the leadership term: cancels and awaits all background tasks
    /// and resets the manager.
    pub async fn revoke_leadership(&self) {
        let term = self.term.lock().expect("poisoned lock").take();
        let Some(term) = term else {
            return;
        };
        info!(
            "Revoking CA leadership in datacenter {}",
            self.manager.config().datacenter
        );

        term.cancel.cancel();
        for res in join_all(term.tasks).await {
            if let Err(e) = res {
                warn!("CA background task did not end cleanly: {e}");
            }
        }
        self.manager.stop();
    }

    /// Follows leadership changes until the sender goes away, then ends
    /// any running term.
    pub async fn run(&self, mut leadership: watch::Receiver<bool>) {
        loop {
            let is_leader = *leadership.borrow_and_update();
            if is_leader {
                self.establish_leadership().await;
            } else {
                self.revoke_leadership().await;
            }
            if leadership.changed().await.is_err() {
                debug!("Leadership notifications ended");
                break;
            }
        }
        self.revoke_leadership().await;
    }
}
