// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-invocation cancellation context.
//!
//! A [`CancellationToken`] is threaded through the lock wait and the child
//! await. Process signals reach a token only through an explicit
//! [`SignalRegistration`], so several invocations inside one host process each
//! observe interrupts without replacing one another's handlers.

use log::{debug, warn};
use signal_hook::SigId;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(windows)]
use signal_hook::consts::signal::SIGBREAK;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Interruption signals that are relayed to the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedSignal {
    Interrupt,
    Terminate,
}

impl ForwardedSignal {
    pub fn raw(self) -> i32 {
        match self {
            ForwardedSignal::Interrupt => SIGINT,
            ForwardedSignal::Terminate => SIGTERM,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ForwardedSignal::Interrupt => "SIGINT",
            ForwardedSignal::Terminate => "SIGTERM",
        }
    }
}

impl fmt::Display for ForwardedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Token used to observe cancellation requests and pending signals.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            interrupt: Arc::new(AtomicBool::new(false)),
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true once any signal or explicit cancel has been observed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels as if a terminate signal had been delivered.
    pub fn cancel(&self) {
        self.cancel_with(ForwardedSignal::Terminate);
    }

    pub fn cancel_with(&self, signal: ForwardedSignal) {
        self.pending_flag(signal).store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Drains signals that have not been forwarded yet, interrupt first.
    pub fn take_pending(&self) -> Vec<ForwardedSignal> {
        [ForwardedSignal::Interrupt, ForwardedSignal::Terminate]
            .into_iter()
            .filter(|signal| self.pending_flag(*signal).swap(false, Ordering::SeqCst))
            .collect()
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `false` when the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Routes process interrupt/terminate signals into this token until the
    /// returned registration is dropped.
    pub fn register_process_signals(&self) -> io::Result<SignalRegistration> {
        let mut ids = Vec::new();

        for (raw, signal) in registered_signals() {
            let targets = [self.pending_flag(*signal).clone(), self.cancelled.clone()];
            for target in targets {
                match flag::register(*raw, target) {
                    Ok(id) => ids.push(id),
                    Err(err) => {
                        warn!("Failed to register cancellation handler for signal {raw}: {err}");
                        drop(SignalRegistration { ids });
                        return Err(err);
                    }
                }
            }
        }

        debug!("Registered {} signal handler(s)", ids.len());
        Ok(SignalRegistration { ids })
    }

    fn pending_flag(&self, signal: ForwardedSignal) -> &Arc<AtomicBool> {
        match signal {
            ForwardedSignal::Interrupt => &self.interrupt,
            ForwardedSignal::Terminate => &self.terminate,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps signal handlers attached to a token; unregisters them on drop.
#[derive(Debug)]
pub struct SignalRegistration {
    ids: Vec<SigId>,
}

impl SignalRegistration {
    fn unregister_all(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        self.unregister_all();
    }
}

fn registered_signals() -> &'static [(i32, ForwardedSignal)] {
    #[cfg(windows)]
    {
        static SIGNALS: [(i32, ForwardedSignal); 3] = [
            (SIGINT, ForwardedSignal::Interrupt),
            (SIGTERM, ForwardedSignal::Terminate),
            (SIGBREAK, ForwardedSignal::Terminate),
        ];
        &SIGNALS
    }

    #[cfg(not(windows))]
    {
        static SIGNALS: [(i32, ForwardedSignal); 2] = [
            (SIGINT, ForwardedSignal::Interrupt),
            (SIGTERM, ForwardedSignal::Terminate),
        ];
        &SIGNALS
    }
}
