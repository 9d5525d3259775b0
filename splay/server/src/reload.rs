//! Process-wide shared state: the mailbox array, the quit flag and the
//! module reload barrier.
//!
//! A reload is a fan-out of stop bytes. Every worker finishes its current
//! event batch, quiesces its module instances and parks in
//! [`ReloadContext::synchronize`]; the last arrival swaps the dynamic
//! libraries and releases everyone. Connections survive because the fds and
//! the per-worker context live in the worker, not in the swapped module. A
//! failed swap aborts the process; there is no partial-reload state.

use crate::mailbox::Mailbox;
use splay_common::Control;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

#[cfg(feature = "reload")]
use splay_common::{
    EXTENSION_ENTRY_SYMBOL, ExtensionEntry, HANDLER_ENTRY_SYMBOL, HandlerEntry,
};
#[cfg(feature = "reload")]
use tracing::{error, info};

struct BarrierState {
    ready: u32,
    generation: u64,
}

#[cfg(feature = "reload")]
#[derive(Default)]
struct LibrarySet {
    handler: Option<libloading::Library>,
    extensions: Vec<libloading::Library>,
}

pub struct ReloadContext {
    workers: u32,
    running: AtomicBool,
    state: Mutex<BarrierState>,
    resume: Condvar,
    mailboxes: Vec<Mailbox>,
    /// Every worker's event-loop handle, registered at worker startup; the
    /// IOCP backend shards its accept pre-posting across these.
    loops: Mutex<Vec<Option<splay_common::Fd>>>,
    #[cfg_attr(not(feature = "reload"), allow(dead_code))]
    handler_path: Option<PathBuf>,
    #[cfg_attr(not(feature = "reload"), allow(dead_code))]
    extension_paths: Vec<PathBuf>,
    #[cfg(feature = "reload")]
    libraries: Mutex<LibrarySet>,
}

impl ReloadContext {
    pub fn new(
        workers: u32,
        handler_path: Option<PathBuf>,
        extension_paths: Vec<PathBuf>,
    ) -> io::Result<Self> {
        let mut mailboxes = Vec::with_capacity(workers as usize);
        for id in 0..workers {
            mailboxes.push(Mailbox::new(id)?);
        }
        let context = Self {
            workers,
            running: AtomicBool::new(true),
            state: Mutex::new(BarrierState {
                ready: 0,
                generation: 0,
            }),
            resume: Condvar::new(),
            mailboxes,
            loops: Mutex::new(vec![None; workers as usize]),
            handler_path,
            extension_paths,
            #[cfg(feature = "reload")]
            libraries: Mutex::new(LibrarySet::default()),
        };
        #[cfg(feature = "reload")]
        context.load_libraries().map_err(io::Error::other)?;
        #[cfg(not(feature = "reload"))]
        if context.handler_path.is_some() || !context.extension_paths.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "module paths given but the reload feature is not built in",
            ));
        }
        Ok(context)
    }

    pub fn workers(&self) -> u32 {
        self.workers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mailbox(&self, id: u32) -> Option<&Mailbox> {
        self.mailboxes.get(id as usize)
    }

    /// Publishes a worker's event-loop handle for the backends that need
    /// the whole array.
    pub fn set_event_loop(&self, id: u32, fd: splay_common::Fd) {
        if let Ok(mut loops) = self.loops.lock() {
            if let Some(slot) = loops.get_mut(id as usize) {
                *slot = Some(fd);
            }
        }
    }

    /// Event-loop handles registered so far, indexed by worker.
    pub fn event_loops(&self) -> Vec<Option<splay_common::Fd>> {
        self.loops
            .lock()
            .map(|loops| loops.clone())
            .unwrap_or_default()
    }

    /// Begins a reload: every worker gets the stop byte and will quiesce.
    /// Refused while a previous reload is still synchronizing.
    pub fn reload(&self) -> io::Result<()> {
        {
            let state = self
                .state
                .lock()
                .map_err(|e| io::Error::other(format!("reload lock: {e}")))?;
            if state.ready != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "reload already in progress",
                ));
            }
        }
        for mailbox in &self.mailboxes {
            mailbox.signal(Control::Stop)?;
        }
        Ok(())
    }

    /// Begins shutdown: every worker gets the quit byte.
    pub fn quit(&self) -> io::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        for mailbox in &self.mailboxes {
            mailbox.signal(Control::Quit)?;
        }
        Ok(())
    }

    /// The reload barrier. Callers arrive with their module instances
    /// already dropped; the last arrival swaps the libraries and wakes the
    /// rest. Returns once the swap for this generation is complete.
    pub fn synchronize(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.ready += 1;
        if state.ready == self.workers {
            state.ready = 0;
            #[cfg(feature = "reload")]
            if let Err(e) = self.load_libraries() {
                // A half-reloaded process would serve from two worlds.
                error!("module reload failed: {e}");
                std::process::abort();
            }
            state.generation += 1;
            self.resume.notify_all();
        } else {
            let generation = state.generation;
            while state.generation == generation {
                state = match self.resume.wait(state) {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
    }

    /// Constructor exported by the handler module, when one is loaded.
    #[cfg(feature = "reload")]
    pub fn handler_entry(&self) -> Option<HandlerEntry> {
        let libraries = self.libraries.lock().ok()?;
        let library = libraries.handler.as_ref()?;
        let symbol = unsafe { library.get::<HandlerEntry>(HANDLER_ENTRY_SYMBOL) }.ok()?;
        Some(*symbol)
    }

    #[cfg(not(feature = "reload"))]
    pub fn handler_entry(&self) -> Option<splay_common::HandlerEntry> {
        None
    }

    /// Extension constructors for the current module generation. Workers
    /// instantiate per-worker copies and drop them before the next swap.
    #[cfg(feature = "reload")]
    pub fn extension_entries(&self) -> Vec<ExtensionEntry> {
        let Ok(libraries) = self.libraries.lock() else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for library in &libraries.extensions {
            match unsafe { library.get::<ExtensionEntry>(EXTENSION_ENTRY_SYMBOL) } {
                Ok(symbol) => entries.push(*symbol),
                Err(e) => error!("extension entry missing: {e}"),
            }
        }
        entries
    }

    #[cfg(not(feature = "reload"))]
    pub fn extension_entries(&self) -> Vec<splay_common::ExtensionEntry> {
        Vec::new()
    }

    #[cfg(feature = "reload")]
    fn load_libraries(&self) -> Result<(), libloading::Error> {
        let mut libraries = self
            .libraries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Old libraries drop first; every instance created from them is
        // gone by the time the barrier lets us in here.
        libraries.handler = None;
        libraries.extensions.clear();
        if let Some(path) = &self.handler_path {
            info!("loading handler module {}", path.display());
            libraries.handler = Some(unsafe { libloading::Library::new(path) }?);
        }
        for path in &self.extension_paths {
            info!("loading extension module {}", path.display());
            libraries
                .extensions
                .push(unsafe { libloading::Library::new(path) }?);
        }
        Ok(())
    }
}
