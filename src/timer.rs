/*
 * Copyright 2020 Damian Peckett <damian@pecke.tt>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use futures::ready;
use futures::task::{Context, Poll};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep_until, Instant, Sleep};

/// A variable time base for an autoscaler's reconcile cycles.
///
/// Fires immediately when created, then every `period` until the period is
/// changed or a tick is forced.
pub(crate) struct RequeueTimer {
    delay: Pin<Box<Sleep>>,
    period: Duration,
}

impl RequeueTimer {
    /// Create a new timer with the specified default period.
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            delay: Box::pin(sleep_until(Instant::now())),
            period,
        }
    }

    /// Schedule the next tick `period` from now, and every `period` after that.
    pub(crate) fn requeue_after(&mut self, period: Duration) {
        self.period = period;
        let deadline = Instant::now() + period;
        self.delay.as_mut().reset(deadline);
    }

    /// Tick as soon as possible, eg. because the autoscaler spec changed.
    pub(crate) fn fire_now(&mut self) {
        self.delay.as_mut().reset(Instant::now());
    }

    fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<Instant> {
        ready!(self.delay.as_mut().poll(cx));

        let now = self.delay.deadline();
        let next = now + self.period;
        self.delay.as_mut().reset(next);

        Poll::Ready(now)
    }
}

impl Stream for RequeueTimer {
    type Item = Instant;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Instant>> {
        Poll::Ready(Some(ready!(self.poll_tick(cx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_first_tick_is_immediate() {
        let mut timer = RequeueTimer::new(Duration::from_secs(45));
        assert!(timeout(Duration::from_millis(100), timer.next())
            .await
            .is_ok());
        // The next tick is a full period away.
        assert!(timeout(Duration::from_millis(50), timer.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_requeue_after_changes_period() {
        let mut timer = RequeueTimer::new(Duration::from_secs(45));
        timer.next().await;

        timer.requeue_after(Duration::from_millis(10));
        assert!(timeout(Duration::from_millis(500), timer.next())
            .await
            .is_ok());
        assert!(timeout(Duration::from_millis(500), timer.next())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_fire_now() {
        let mut timer = RequeueTimer::new(Duration::from_secs(45));
        timer.next().await;

        timer.fire_now();
        assert!(timeout(Duration::from_millis(100), timer.next())
            .await
            .is_ok());
    }
}
