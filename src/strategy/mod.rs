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

use crate::strategy::tolerance_band::ToleranceBandStrategy;
use chrono::TimeDelta;
use enum_dispatch::enum_dispatch;

/// Tolerance band autoscaling strategy implementation.
pub mod tolerance_band;

/// Which way a decision moves the replica count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
    /// No scaling action.
    Hold,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
            ScaleDirection::Hold => "none",
        }
    }
}

/// Outcome of evaluating a strategy, produced fresh every cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconcileDecision {
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub direction: ScaleDirection,
    pub observed_metric: f64,
}

impl ReconcileDecision {
    /// A decision that leaves the replica count alone.
    pub fn hold(current_replicas: i32, observed_metric: f64) -> Self {
        Self {
            current_replicas,
            desired_replicas: current_replicas,
            direction: ScaleDirection::Hold,
            observed_metric,
        }
    }
}

/// Autoscaling strategies / control algorithms.
#[enum_dispatch]
#[derive(Clone, Debug)]
pub enum AutoScalerStrategy {
    ToleranceBand(ToleranceBandStrategy),
}

/// Autoscaling strategy trait.
#[enum_dispatch(AutoScalerStrategy)]
pub trait AutoScalerStrategyTrait {
    /// What is the next desired state? `since_last_scale` is `None` when the
    /// target has never been scaled.
    fn evaluate(
        &self,
        current_replicas: i32,
        observed_metric: f64,
        since_last_scale: Option<TimeDelta>,
    ) -> ReconcileDecision;
}
