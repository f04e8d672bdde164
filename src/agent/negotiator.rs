//! Connection negotiation: port discovery, authentication and the
//! accept / configure handshake.
//!
//! Discovery probes every port of the configured range in parallel. Probes
//! race into a single-assignment winner slot owned by their discovery cycle;
//! the negotiator reads the slot, never the probes, so a late answer from a
//! discarded candidate cannot resurrect it.

use super::driver::DriverInner;
use super::error::DriverError;
use super::model::{AcceptDecision, KeyGrant};
use super::poll::{poll_with_fixed_delay, PollStep};
use super::requests::{CONTROL_ACCEPTED, FEED_CONFIGURATION, KEY_PERSISTENCE, PING, REQUEST_CONTROL};
use super::transport::{AgentConnection, RequestOutcome};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Where a connection attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Discovering,
    Authenticating(u16),
    WaitingAccept(u16),
    PushingConfig(u16),
    WaitingConfigured(u16),
    PersistingKey(u16),
    Ready(u16),
    Failed(DriverError),
}

/// Candidates of one discovery run and the slot they race into.
pub(crate) struct DiscoveryCycle {
    candidates: Mutex<Vec<u16>>,
    winner: OnceLock<AgentConnection>,
}

impl DiscoveryCycle {
    pub(crate) fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            candidates: Mutex::new(ports.into_iter().collect()),
            winner: OnceLock::new(),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.candidates.lock().len()
    }

    fn discard(&self, port: u16) {
        self.candidates.lock().retain(|candidate| *candidate != port);
    }

    fn retain_only(&self, port: u16) {
        self.candidates.lock().retain(|candidate| *candidate == port);
    }

    fn clear(&self) {
        self.candidates.lock().clear();
    }

    fn holds(&self, port: u16) -> bool {
        self.candidates.lock().contains(&port)
    }

    fn is_decided(&self) -> bool {
        self.winner.get().is_some()
    }

    /// First caller wins; everyone after that is told no.
    fn claim(&self, connection: AgentConnection) -> bool {
        self.winner.set(connection).is_ok()
    }

    fn winner(&self) -> Option<AgentConnection> {
        self.winner.get().cloned()
    }
}

/// Drives one connection attempt to `Ready` or `Failed`.
///
/// The caller has already checked preconditions, holds the busy flag and has
/// published `cycle` as the in-flight discovery.
pub(crate) async fn negotiate(
    inner: Arc<DriverInner>,
    cycle: Arc<DiscoveryCycle>,
    backend_url: Option<String>,
) -> Result<(), DriverError> {
    let result = run(&inner, &cycle, backend_url).await;
    *inner.discovery.lock() = None;

    match result {
        Ok(port) => {
            info!(port, "the agent and the driver are now ready");
            inner.set_state(NegotiationState::Ready(port));
            Ok(())
        }
        Err(error) => {
            *inner.confirmed.lock() = None;
            warn!(code = %error.hex_code(), "connection attempt failed: {error}");
            inner.set_state(NegotiationState::Failed(error));
            Err(error)
        }
    }
}

async fn run(
    inner: &Arc<DriverInner>,
    cycle: &Arc<DiscoveryCycle>,
    backend_url: Option<String>,
) -> Result<u16, DriverError> {
    let (access_key, storage_usable) = load_access_key(inner);

    let connection = discover(inner, cycle, access_key).await?;
    let port = connection.port();
    *inner.confirmed.lock() = Some(connection.clone());
    cycle.retain_only(port);

    inner.set_state(NegotiationState::WaitingAccept(port));
    wait_for_accept(inner, &connection).await?;
    info!(port, "connection accepted");
    cycle.clear();

    inner.set_state(NegotiationState::PushingConfig(port));
    let fed = inner
        .perform(&connection, &FEED_CONFIGURATION, &backend_url)
        .await;
    if fed != RequestOutcome::Completed(true) {
        return Err(DriverError::ConfigFeedFailed);
    }

    info!(port, "waiting for the agent to configure itself");
    inner.set_state(NegotiationState::WaitingConfigured(port));
    inner
        .wait_until_idle(&connection, DriverError::ConfigFeedFailed)
        .await?;

    if storage_usable {
        inner.set_state(NegotiationState::PersistingKey(port));
        persist_access_key(inner, &connection).await;
    }

    Ok(port)
}

/// Reads the remembered access key. Unusable storage is not an error.
fn load_access_key(inner: &DriverInner) -> (Option<String>, bool) {
    let Some(store) = inner.key_store.as_ref() else {
        return (None, false);
    };
    match store.load() {
        Ok(key) => (key, true),
        Err(error) => {
            warn!("couldn't load the persistent access key, continuing without it: {error:#}");
            (None, false)
        }
    }
}

async fn discover(
    inner: &Arc<DriverInner>,
    cycle: &Arc<DiscoveryCycle>,
    access_key: Option<String>,
) -> Result<AgentConnection, DriverError> {
    let mut probes = JoinSet::new();
    for port in inner.settings.ports() {
        probes.spawn(probe(
            Arc::clone(inner),
            Arc::clone(cycle),
            port,
            access_key.clone(),
        ));
    }

    while probes.join_next().await.is_some() {
        if let Some(winner) = cycle.winner() {
            // Losers finish on their own and find the slot taken.
            probes.detach_all();
            return Ok(winner);
        }
    }

    warn!(
        base_port = inner.settings.base_port,
        span = inner.settings.port_span,
        "no agent granted control on any probed port"
    );
    Err(DriverError::OpenFailed)
}

async fn probe(
    inner: Arc<DriverInner>,
    cycle: Arc<DiscoveryCycle>,
    port: u16,
    access_key: Option<String>,
) {
    let candidate = AgentConnection::new(port);

    let answered = inner.perform(&candidate, &PING, &()).await == RequestOutcome::Completed(true);
    if !answered || cycle.is_decided() {
        cycle.discard(port);
        return;
    }

    info!(port, "agent responded to the ping");
    inner.state.send_if_modified(|state| {
        // Take over from a candidate that has already been discarded.
        let vacant = match *state {
            NegotiationState::Discovering => true,
            NegotiationState::Authenticating(current) => current != port && !cycle.holds(current),
            _ => false,
        };
        if vacant {
            *state = NegotiationState::Authenticating(port);
        }
        vacant
    });

    match inner
        .perform(&candidate, &REQUEST_CONTROL, &access_key)
        .await
        .value()
    {
        Some(cookie) => {
            let connection = candidate.with_cookie(cookie);
            let mut claimed = false;
            // Claiming under the state lock keeps `Authenticating(winner)`
            // ahead of the negotiator's `WaitingAccept(winner)`.
            inner.state.send_if_modified(|state| {
                claimed = cycle.claim(connection);
                let stale = match *state {
                    NegotiationState::Discovering => true,
                    NegotiationState::Authenticating(current) => current != port,
                    _ => false,
                };
                if claimed && stale {
                    *state = NegotiationState::Authenticating(port);
                }
                claimed && stale
            });
            if claimed {
                info!(port, "authentication cookie received");
                return;
            }
            debug!(port, "another agent was confirmed first, discarding candidate");
        }
        None => debug!(port, "agent did not hand out an authentication cookie"),
    }
    cycle.discard(port);
}

async fn wait_for_accept(
    inner: &DriverInner,
    connection: &AgentConnection,
) -> Result<(), DriverError> {
    let port = connection.port();
    poll_with_fixed_delay(inner.settings.poll_interval, || async move {
        match inner
            .perform(connection, &CONTROL_ACCEPTED, &())
            .await
            .value()
        {
            Some(AcceptDecision::Accepted) => PollStep::Ready(()),
            Some(AcceptDecision::Wait) => {
                debug!(port, "agent has not decided yet");
                PollStep::Pending
            }
            Some(AcceptDecision::Refused) => {
                info!(port, "agent refused the connection");
                PollStep::Failed(DriverError::Refused)
            }
            None => {
                warn!(port, "control_accepted failed or answered garbage");
                PollStep::Failed(DriverError::Refused)
            }
        }
    })
    .await
}

/// Asks for a long-lived key and remembers it. Never fails the session.
async fn persist_access_key(inner: &DriverInner, connection: &AgentConnection) {
    let Some(store) = inner.key_store.as_ref() else {
        return;
    };

    match inner
        .perform(connection, &KEY_PERSISTENCE, &())
        .await
        .value()
    {
        Some(KeyGrant::Granted(key)) => match store.store(&key) {
            Ok(()) => info!("the agent has granted a persistent access key"),
            Err(error) => warn!("failed to remember the access key, ignoring: {error:#}"),
        },
        Some(KeyGrant::Denied) => info!("the agent declined to grant a persistent access key"),
        None => warn!("retrieving the persistent access key failed, ignoring"),
    }
}
