// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Inactivity timer: fires a callback once after a silent window.
//!
//! `touch` restarts the window; `clear` cancels definitively until the
//! next `touch`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fire-once-after-silence timer.
pub struct InactivityTimer {
    window: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    generation: Arc<AtomicU64>,
}

impl InactivityTimer {
    /// Timer firing `callback` once after `window` of silence following a
    /// `touch`.
    pub fn new(window: Duration, callback: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            window,
            callback,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Restart the silent window.
    pub fn touch(&self) {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let callback = Arc::clone(&self.callback);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Fire only if nothing touched or cleared meanwhile.
            if generation.load(Ordering::SeqCst) == armed {
                callback();
            }
        });
    }

    /// Cancel definitively; no fire until the next `touch`.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_silence() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let timer = InactivityTimer::new(
            Duration::from_millis(100),
            Arc::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.touch();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_postpones_and_clear_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let timer = InactivityTimer::new(
            Duration::from_millis(100),
            Arc::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.touch();
        tokio::time::sleep(Duration::from_millis(60)).await;
        timer.touch(); // restart the window
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        timer.clear();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
