//! Engine collaborator and the shared link context.
//!
//! The engine interprets the bytecode carried by the link; this crate only
//! routes bytes to it. A [`LinkContext`] is built once per process, handed to
//! every connector and explicitly initialised and torn down.

use {
    crate::{
        config::LinkConfig,
        connection::Connection,
        error::{Error, Result},
        protocol::ClockSample,
    },
    log::{debug, info, warn},
    std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// The bytecode engine the connectors dispatch inbound traffic to.
pub trait Engine: Send + Sync {
    /// Execute network bytecode received from `source`.
    fn execute(&self, bytes: &[u8], source: &Connection) -> Result<()>;

    /// Answer a device request received from `source`.
    fn request(&self, bytes: &[u8], source: &Connection) -> Result<Vec<u8>>;

    /// Adopt a clock sample pushed by `source`.
    fn synchronize(&self, sample: &ClockSample, source: &Connection) -> Result<()>;
}

/// Callback polled by long-running loops; returns true when the application
/// wants to stop.
pub type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

/// Process-wide state shared by all connectors.
pub struct LinkContext {
    engine: Arc<dyn Engine>,
    config: LinkConfig,
    initialized: AtomicBool,
    interrupt: Option<InterruptChecker>,
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl LinkContext {
    /// Create an uninitialised context.
    pub fn new(engine: Arc<dyn Engine>, config: LinkConfig) -> Self {
        Self {
            engine,
            config,
            initialized: AtomicBool::new(false),
            interrupt: None,
        }
    }

    /// Install an interrupt checker.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupt = Some(Arc::new(checker));
        self
    }

    /// Mark the context ready for dispatch.
    pub fn init(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("link context initialized");
        }
    }

    /// Stop dispatching into the engine.
    pub fn teardown(&self) {
        if self.initialized.swap(false, Ordering::SeqCst) {
            info!("link context torn down");
        }
    }

    /// Whether dispatch is enabled.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Fail with [`Error::Interrupted`] if the application asked to stop.
    pub fn check_interrupted(&self) -> Result<()> {
        match &self.interrupt {
            Some(checker) if checker() => Err(Error::Interrupted),
            _ => Ok(()),
        }
    }

    /// The engine, if the context is initialised.
    pub fn engine(&self) -> Result<&Arc<dyn Engine>> {
        if self.is_initialized() {
            Ok(&self.engine)
        } else {
            Err(Error::EngineNotInitialized)
        }
    }

    /// Route network bytecode into the engine. Failures are logged.
    pub fn dispatch_execute(&self, bytes: &[u8], source: &Connection) {
        match self.engine() {
            Ok(engine) => {
                if let Err(e) = engine.execute(bytes, source) {
                    warn!("engine rejected execute from {source}: {e}");
                }
            },
            Err(_) => debug!("dropping execute from {source}: engine not initialized"),
        }
    }

    /// Route a device request into the engine.
    pub fn dispatch_request(&self, bytes: &[u8], source: &Connection) -> Result<Vec<u8>> {
        self.engine()?
            .request(bytes, source)
    }

    /// Route a clock sample into the engine. Failures are logged.
    pub fn dispatch_synchronize(&self, sample: &ClockSample, source: &Connection) {
        match self.engine() {
            Ok(engine) => {
                if let Err(e) = engine.synchronize(sample, source) {
                    warn!("engine rejected clock sample from {source}: {e}");
                }
            },
            Err(_) => debug!("dropping clock sample from {source}: engine not initialized"),
        }
    }
}
