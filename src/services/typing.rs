//! Incremental reveal of assistant text ("typing" animation).
//!
//! The reveal runs on its own timer task, independent of store mutations. A
//! handle cancels it; after `cancel` returns, no further callbacks fire. The
//! [`TypingAnimator`] registry additionally guarantees at most one live
//! animation per message id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::plugins::history::Message;

use super::config::{env_u64, env_usize};

const DEFAULT_STEP_CHARS: usize = 3;
const DEFAULT_INTERVAL_MS: u64 = 30;

pub struct TypingHandle {
    cancelled: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl TypingHandle {
    /// Halt the animation. No `on_partial`/`on_complete` call is delivered
    /// after this returns.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the animation completed or was cancelled.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Reveal `full_text` in prefix steps of `step_chars` characters every
/// `interval`, ending with exactly one `on_complete(full_text)`.
///
/// Partials are strictly growing proper prefixes; the full text is delivered
/// only through `on_complete`.
pub fn simulate_typing(
    full_text: impl Into<String>,
    step_chars: usize,
    interval: Duration,
    on_partial: impl Fn(&str) + Send + 'static,
    on_complete: impl FnOnce(&str) + Send + 'static,
) -> TypingHandle {
    let text: String = full_text.into();
    let step = step_chars.max(1);
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancelled.clone();

    let task = tokio::spawn(async move {
        let total_chars = text.chars().count();
        let mut shown = 0usize;

        loop {
            tokio::time::sleep(interval).await;
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            shown += step;
            if shown >= total_chars {
                break;
            }
            let prefix_end = text
                .char_indices()
                .nth(shown)
                .map(|(i, _)| i)
                .unwrap_or(text.len());
            on_partial(&text[..prefix_end]);
        }

        if cancel_flag.load(Ordering::SeqCst) {
            return;
        }
        on_complete(&text);
    });

    TypingHandle { cancelled, task }
}

/// Per-message animation registry. Re-animating a message id cancels the
/// previous run first; concurrent animations of one message cannot happen.
pub struct TypingAnimator {
    step_chars: usize,
    interval: Duration,
    registry: Mutex<HashMap<String, TypingHandle>>,
}

impl TypingAnimator {
    pub fn new(step_chars: usize, interval: Duration) -> Self {
        Self {
            step_chars: step_chars.max(1),
            interval,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Reads `TYPING_STEP_CHARS` (default 3) and `TYPING_INTERVAL_MS` (default 30).
    pub fn from_env() -> Self {
        Self::new(
            env_usize("TYPING_STEP_CHARS", DEFAULT_STEP_CHARS).clamp(1, 64),
            Duration::from_millis(env_u64("TYPING_INTERVAL_MS", DEFAULT_INTERVAL_MS).clamp(1, 1_000)),
        )
    }

    /// Start revealing `message`. A message already marked as animated gets
    /// its full text immediately through `on_complete`, with no timer task.
    pub fn animate(
        &self,
        message: &Message,
        on_partial: impl Fn(&str) + Send + 'static,
        on_complete: impl FnOnce(&str) + Send + 'static,
    ) {
        if !message.should_animate() {
            on_complete(&message.text);
            return;
        }

        let handle = simulate_typing(
            message.text.clone(),
            self.step_chars,
            self.interval,
            on_partial,
            on_complete,
        );

        let Ok(mut registry) = self.registry.lock() else {
            handle.cancel();
            return;
        };
        registry.retain(|_, h| !h.is_finished());
        if let Some(previous) = registry.insert(message.id.clone(), handle) {
            previous.cancel();
        }
    }

    /// Cancel the live animation for `message_id`, if any.
    pub fn cancel(&self, message_id: &str) {
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        if let Some(handle) = registry.remove(message_id) {
            handle.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        for (_, handle) in registry.drain() {
            handle.cancel();
        }
    }

    /// Take the live handle for a message id (used by tests and teardown).
    pub(crate) fn take(&self, message_id: &str) -> Option<TypingHandle> {
        self.registry.lock().ok()?.remove(message_id)
    }
}

impl Drop for TypingAnimator {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            for (_, handle) in registry.drain() {
                handle.cancel();
            }
        }
    }
}
