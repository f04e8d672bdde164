//! The driver facade: one connection, one operation at a time.
//!
//! Every public operation checks its preconditions synchronously and either
//! rejects the call straight away or claims the busy flag and hands back a
//! [`Pending`] future for the background work. The flag is released when that
//! work ends, whether or not the caller is still waiting on it.

use super::error::DriverError;
use super::model::{
    ActionHistoryRecord, ActionOutcome, ActionRequest, ActionResult, AgentState, CatalogPage,
    CatalogQuery, SearchResult,
};
use super::negotiator::{negotiate, DiscoveryCycle, NegotiationState};
use super::poll::{poll_with_fixed_delay, PollStep};
use super::requests::{
    RequestDescriptor, ACTIONS_HISTORY, ACTION_RESULTS, FETCH_CATALOG, PERFORM_ACTIONS,
    SEARCH_PRODUCTS, SEARCH_RESULTS, STATUS,
};
use super::key_store::KeyStore;
use super::transport::{AgentConnection, RequestOutcome, Transport};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_PORT: u16 = 17458;
pub const DEFAULT_PORT_SPAN: u16 = 20;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Tunables for discovery and polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    pub base_port: u16,
    pub port_span: u16,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            port_span: DEFAULT_PORT_SPAN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl DriverSettings {
    /// Ports probed during discovery, clipped at `u16::MAX`.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.port_span).filter_map(|offset| self.base_port.checked_add(offset))
    }
}

pub(crate) struct DriverInner {
    pub(crate) settings: DriverSettings,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) key_store: Option<Arc<dyn KeyStore>>,
    busy: AtomicBool,
    pub(crate) confirmed: Mutex<Option<AgentConnection>>,
    pub(crate) discovery: Mutex<Option<Arc<DiscoveryCycle>>>,
    products: RwLock<Vec<SearchResult>>,
    pub(crate) state: watch::Sender<NegotiationState>,
}

impl DriverInner {
    pub(crate) async fn perform<P, R>(
        &self,
        connection: &AgentConnection,
        descriptor: &RequestDescriptor<P, R>,
        params: &P,
    ) -> RequestOutcome<R> {
        connection
            .perform(
                self.transport.as_ref(),
                self.settings.request_timeout,
                descriptor,
                params,
            )
            .await
    }

    pub(crate) fn set_state(&self, state: NegotiationState) {
        debug!(?state, "negotiation state changed");
        self.state.send_replace(state);
    }

    /// Polls `status` until the agent reports IDLE.
    ///
    /// BUSY keeps polling. Anything else, including UNCONFIGURED and
    /// transport failures, ends with `failure`.
    pub(crate) async fn wait_until_idle(
        &self,
        connection: &AgentConnection,
        failure: DriverError,
    ) -> Result<(), DriverError> {
        let port = connection.port();
        poll_with_fixed_delay(self.settings.poll_interval, || async move {
            match self.perform(connection, &STATUS, &()).await.value() {
                Some(AgentState::Idle) => PollStep::Ready(()),
                Some(AgentState::Busy) => PollStep::Pending,
                other => {
                    warn!(port, state = ?other, "agent left the busy state abnormally");
                    PollStep::Failed(failure)
                }
            }
        })
        .await
    }

    async fn search_products(
        &self,
        connection: &AgentConnection,
    ) -> Result<Vec<SearchResult>, DriverError> {
        if self.perform(connection, &SEARCH_PRODUCTS, &()).await != RequestOutcome::Completed(true) {
            return Err(DriverError::SearchFailed);
        }

        info!("product search started, waiting for the agent");
        self.wait_until_idle(connection, DriverError::SearchFailed)
            .await?;

        let products = self
            .perform(connection, &SEARCH_RESULTS, &())
            .await
            .value()
            .ok_or(DriverError::SearchFailed)?;
        info!(count = products.len(), "product search finished");
        self.products.write().clone_from(&products);
        Ok(products)
    }

    async fn perform_actions(
        &self,
        connection: &AgentConnection,
        request: ActionRequest,
    ) -> Result<Vec<ActionResult>, DriverError> {
        let kind = request.kind();
        if self.perform(connection, &PERFORM_ACTIONS, &request).await
            != RequestOutcome::Completed(true)
        {
            return Err(DriverError::ActionsFailed);
        }

        info!(action = kind.as_str(), "actions started, waiting for the agent");
        self.wait_until_idle(connection, DriverError::ActionsFailed)
            .await?;

        let outcomes = self
            .perform(connection, &ACTION_RESULTS, &())
            .await
            .value()
            .ok_or(DriverError::ActionsFailed)?;
        Ok(self.attach_products(outcomes))
    }

    /// Pairs `(index, code)` lines with cached products, in body order.
    fn attach_products(&self, outcomes: Vec<(usize, i32)>) -> Vec<ActionResult> {
        let products = self.products.read();
        outcomes
            .into_iter()
            .filter_map(|(index, code)| match products.get(index) {
                Some(product) => Some(ActionResult {
                    product: product.clone(),
                    outcome: ActionOutcome::from_code(code),
                }),
                None => {
                    warn!(index, "agent reported an outcome for an unknown product, skipping");
                    None
                }
            })
            .collect()
    }
}

/// Holds the busy flag for the lifetime of one operation.
struct BusyGuard {
    inner: Arc<DriverInner>,
}

impl BusyGuard {
    fn acquire(inner: &Arc<DriverInner>) -> Result<Self, DriverError> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DriverError::DriverBusy)?;
        Ok(Self {
            inner: Arc::clone(inner),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::Release);
    }
}

/// Completion of an accepted operation.
///
/// Dropping it detaches the work instead of cancelling it: the operation still
/// runs to the end and releases the busy flag.
#[must_use = "the outcome of the operation is only observable through this future"]
pub struct Pending<T> {
    handle: JoinHandle<Result<T, DriverError>>,
    failure: DriverError,
}

impl<T: Send + 'static> Pending<T> {
    fn spawn<F>(guard: BusyGuard, failure: DriverError, work: F) -> Self
    where
        F: Future<Output = Result<T, DriverError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });
        Self { handle, failure }
    }
}

impl<T> Pending<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, DriverError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let failure = this.failure;
        Pin::new(&mut this.handle).poll(cx).map(|joined| {
            joined.unwrap_or_else(|error| {
                warn!(%error, "driver task ended abnormally");
                Err(failure)
            })
        })
    }
}

/// Client of a local updater agent. Cheap to clone; clones share one session.
///
/// Operations spawn onto the ambient Tokio runtime and must be started from
/// within one.
#[derive(Clone)]
pub struct AgentDriver {
    inner: Arc<DriverInner>,
}

impl AgentDriver {
    pub fn new(
        settings: DriverSettings,
        transport: Arc<dyn Transport>,
        key_store: Option<Arc<dyn KeyStore>>,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            inner: Arc::new(DriverInner {
                settings,
                transport,
                key_store,
                busy: AtomicBool::new(false),
                confirmed: Mutex::new(None),
                discovery: Mutex::new(None),
                products: RwLock::new(Vec::new()),
                state,
            }),
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> NegotiationState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.inner.state.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// The confirmed connection, once authentication has succeeded.
    pub fn connection(&self) -> Option<AgentConnection> {
        self.inner.confirmed.lock().clone()
    }

    /// Candidate ports of the running discovery that are still in play.
    pub fn outstanding_probes(&self) -> usize {
        self.inner
            .discovery
            .lock()
            .as_ref()
            .map_or(0, |cycle| cycle.outstanding())
    }

    /// Products from the last completed search, in agent order.
    pub fn cached_products(&self) -> Vec<SearchResult> {
        self.inner.products.read().clone()
    }

    /// Position of `product` in the cached search results.
    pub fn cached_index_of(&self, product: &SearchResult) -> Option<usize> {
        self.inner
            .products
            .read()
            .iter()
            .position(|cached| cached == product)
    }

    /// Forgets the session so `open_connection` can run again.
    pub fn reset(&self) -> Result<(), DriverError> {
        let _guard = BusyGuard::acquire(&self.inner)?;
        *self.inner.confirmed.lock() = None;
        *self.inner.discovery.lock() = None;
        self.inner.products.write().clear();
        self.inner.set_state(NegotiationState::Idle);
        info!("driver session reset");
        Ok(())
    }

    /// Discovers an agent, authenticates and pushes `backend_url` to it.
    pub fn open_connection(&self, backend_url: Option<String>) -> Result<Pending<()>, DriverError> {
        if self.inner.confirmed.lock().is_some() {
            return Err(DriverError::AlreadyOpen);
        }
        if self.outstanding_probes() > 0 {
            return Err(DriverError::PendingOpen);
        }
        let guard = BusyGuard::acquire(&self.inner)?;

        let cycle = Arc::new(DiscoveryCycle::new(self.inner.settings.ports()));
        *self.inner.discovery.lock() = Some(Arc::clone(&cycle));
        self.inner.set_state(NegotiationState::Discovering);
        info!(
            base_port = self.inner.settings.base_port,
            span = self.inner.settings.port_span,
            "looking for a local agent"
        );

        let inner = Arc::clone(&self.inner);
        Ok(Pending::spawn(guard, DriverError::OpenFailed, negotiate(inner, cycle, backend_url)))
    }

    /// Runs a product search and replaces the cached results.
    ///
    /// The cache is emptied as soon as the search is accepted.
    pub fn search_products(&self) -> Result<Pending<Vec<SearchResult>>, DriverError> {
        let (connection, guard) = self.begin_operation()?;
        self.inner.products.write().clear();

        let inner = Arc::clone(&self.inner);
        Ok(Pending::spawn(guard, DriverError::SearchFailed, async move {
            inner.search_products(&connection).await
        }))
    }

    pub fn fetch_catalog(&self, query: CatalogQuery) -> Result<Pending<CatalogPage>, DriverError> {
        let (connection, guard) = self.begin_operation()?;

        let inner = Arc::clone(&self.inner);
        Ok(Pending::spawn(guard, DriverError::CatalogFetchFailed, async move {
            inner
                .perform(&connection, &FETCH_CATALOG, &query)
                .await
                .value()
                .ok_or(DriverError::CatalogFetchFailed)
        }))
    }

    pub fn fetch_history(&self) -> Result<Pending<Vec<ActionHistoryRecord>>, DriverError> {
        let (connection, guard) = self.begin_operation()?;

        let inner = Arc::clone(&self.inner);
        Ok(Pending::spawn(guard, DriverError::HistoryFetchFailed, async move {
            inner
                .perform(&connection, &ACTIONS_HISTORY, &())
                .await
                .value()
                .ok_or(DriverError::HistoryFetchFailed)
        }))
    }

    /// Starts updates or rollbacks and reports one outcome per product.
    ///
    /// Indices refer to [`Self::cached_products`]; the cache must not be
    /// refreshed between selecting products and calling this.
    pub fn perform_actions(
        &self,
        request: ActionRequest,
    ) -> Result<Pending<Vec<ActionResult>>, DriverError> {
        let (connection, guard) = self.begin_operation()?;

        let inner = Arc::clone(&self.inner);
        Ok(Pending::spawn(guard, DriverError::ActionsFailed, async move {
            inner.perform_actions(&connection, request).await
        }))
    }

    fn begin_operation(&self) -> Result<(AgentConnection, BusyGuard), DriverError> {
        let connection = self.connection().ok_or(DriverError::NotOpened)?;
        let guard = BusyGuard::acquire(&self.inner)?;
        Ok((connection, guard))
    }
}
