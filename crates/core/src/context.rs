//! Shared context produced once by the application's init function.
//!
//! The context is written exactly once and read by every handler afterwards.
//! Handlers receive `&C`; anything that must change at runtime has to carry its
//! own synchronization inside `C`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use crate::error::{InitError, panic_message};

/// Write-once holder for the application context.
pub struct ContextStore<C> {
    slot: OnceLock<Arc<C>>,
}

impl<C> ContextStore<C> {
    pub fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    /// Install the context. A second install is rejected and the first value kept.
    pub fn install(&self, context: C) -> Result<Arc<C>, InitError> {
        let context = Arc::new(context);
        self.slot
            .set(Arc::clone(&context))
            .map_err(|_| InitError::AlreadyInitialized)?;
        Ok(context)
    }

    pub fn get(&self) -> Option<Arc<C>> {
        self.slot.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<C> Default for ContextStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

/// Runs the init function exactly once and records where it ended up.
pub struct InitLifecycle<C> {
    state: Mutex<InitState>,
    store: ContextStore<C>,
}

impl<C> InitLifecycle<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Uninitialized),
            store: ContextStore::new(),
        }
    }

    pub fn state(&self) -> InitState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn context(&self) -> Option<Arc<C>> {
        self.store.get()
    }

    /// Run `init` and install its result. Failure is terminal; panics count as failure.
    pub fn run<F>(&self, init: F) -> Result<Arc<C>, InitError>
    where
        F: FnOnce() -> anyhow::Result<C>,
    {
        self.transition_to_initializing()?;

        tracing::info!("Running init()");
        let started = Instant::now();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(init)) {
            Ok(Ok(context)) => self.store.install(context),
            Ok(Err(err)) => Err(InitError::Failed(format!("{:#}", err))),
            Err(payload) => Err(InitError::Panicked(panic_message(payload.as_ref()))),
        };

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &outcome {
            Ok(_) => {
                *state = InitState::Ready;
                tracing::info!("init() finished in {}ms", started.elapsed().as_millis());
            }
            Err(err) => {
                *state = InitState::Failed(err.to_string());
                tracing::error!("{}", err);
            }
        }
        outcome
    }

    fn transition_to_initializing(&self) -> Result<(), InitError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            InitState::Uninitialized => {
                *state = InitState::Initializing;
                Ok(())
            }
            InitState::Initializing => Err(InitError::InProgress),
            InitState::Ready => Err(InitError::AlreadyInitialized),
            InitState::Failed(_) => Err(InitError::PreviouslyFailed),
        }
    }
}

impl<C> Default for InitLifecycle<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Model {
        name: &'static str,
    }

    #[test]
    fn store_installs_once_and_keeps_first_value() {
        let store = ContextStore::new();
        assert!(!store.is_ready());
        store.install(Model { name: "first" }).unwrap();
        let err = store.install(Model { name: "second" }).unwrap_err();
        assert_eq!(err, InitError::AlreadyInitialized);
        assert_eq!(store.get().unwrap().name, "first");
    }

    #[test]
    fn successful_init_reaches_ready() {
        let lifecycle = InitLifecycle::new();
        assert_eq!(lifecycle.state(), InitState::Uninitialized);
        let context = lifecycle.run(|| Ok(Model { name: "echo" })).unwrap();
        assert_eq!(context.name, "echo");
        assert_eq!(lifecycle.state(), InitState::Ready);
        assert_eq!(lifecycle.context().unwrap().name, "echo");
    }

    #[test]
    fn rerunning_init_after_ready_is_rejected() {
        let lifecycle = InitLifecycle::new();
        lifecycle.run(|| Ok(Model { name: "echo" })).unwrap();
        let mut ran = false;
        let err = lifecycle
            .run(|| {
                ran = true;
                Ok(Model { name: "other" })
            })
            .unwrap_err();
        assert_eq!(err, InitError::AlreadyInitialized);
        assert!(!ran);
        assert_eq!(lifecycle.context().unwrap().name, "echo");
    }

    #[test]
    fn failed_init_is_terminal() {
        let lifecycle: InitLifecycle<Model> = InitLifecycle::new();
        let err = lifecycle
            .run(|| Err(anyhow::anyhow!("weights not found")))
            .unwrap_err();
        assert_eq!(err, InitError::Failed("weights not found".to_string()));
        assert!(matches!(lifecycle.state(), InitState::Failed(_)));
        assert!(lifecycle.context().is_none());

        let retry = lifecycle.run(|| Ok(Model { name: "late" })).unwrap_err();
        assert_eq!(retry, InitError::PreviouslyFailed);
        assert!(lifecycle.context().is_none());
    }

    #[test]
    fn panicking_init_is_reported_as_failure() {
        let lifecycle: InitLifecycle<Model> = InitLifecycle::new();
        let err = lifecycle.run(|| panic!("driver crashed")).unwrap_err();
        assert_eq!(err, InitError::Panicked("driver crashed".to_string()));
        assert!(matches!(lifecycle.state(), InitState::Failed(_)));
    }
}
