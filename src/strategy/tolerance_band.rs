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

use crate::resource::{Policy, ScaleBounds};
use crate::strategy::{AutoScalerStrategyTrait, ReconcileDecision, ScaleDirection};
use chrono::TimeDelta;

/// Step controller around a target value with a symmetric dead band.
///
/// Assumes a validated spec: `min_replicas <= max_replicas`, `step >= 1` and a
/// non-negative tolerance.
#[derive(Clone, Debug)]
pub struct ToleranceBandStrategy {
    bounds: ScaleBounds,
    target: f64,
    tolerance: f64,
    step: i32,
    cooldown_seconds: i64,
}

impl ToleranceBandStrategy {
    pub fn new(bounds: &ScaleBounds, policy: &Policy) -> Self {
        Self {
            bounds: *bounds,
            target: policy.cpu_target_percent as f64,
            tolerance: policy.tolerance_percent as f64,
            step: policy.step,
            cooldown_seconds: policy.cooldown_seconds,
        }
    }

    fn in_cooldown(&self, since_last_scale: Option<TimeDelta>) -> bool {
        match since_last_scale {
            Some(elapsed) => {
                elapsed.num_milliseconds() < self.cooldown_seconds.saturating_mul(1_000)
            }
            None => false,
        }
    }
}

impl AutoScalerStrategyTrait for ToleranceBandStrategy {
    fn evaluate(
        &self,
        current_replicas: i32,
        observed_metric: f64,
        since_last_scale: Option<TimeDelta>,
    ) -> ReconcileDecision {
        if self.in_cooldown(since_last_scale) {
            return ReconcileDecision::hold(current_replicas, observed_metric);
        }

        let upper = self.target + self.tolerance;
        let lower = self.target - self.tolerance;
        let ScaleBounds {
            min_replicas,
            max_replicas,
        } = self.bounds;

        // Scale up is checked first.
        let (desired_replicas, direction) =
            if observed_metric > upper && current_replicas < max_replicas {
                (
                    current_replicas.saturating_add(self.step).min(max_replicas),
                    ScaleDirection::Up,
                )
            } else if observed_metric < lower && current_replicas > min_replicas {
                (
                    current_replicas.saturating_sub(self.step).max(min_replicas),
                    ScaleDirection::Down,
                )
            } else {
                return ReconcileDecision::hold(current_replicas, observed_metric);
            };

        ReconcileDecision {
            current_replicas,
            desired_replicas,
            direction,
            observed_metric,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strategy(step: i32, cooldown_seconds: i64) -> ToleranceBandStrategy {
        ToleranceBandStrategy::new(
            &ScaleBounds {
                min_replicas: 2,
                max_replicas: 10,
            },
            &Policy {
                cpu_target_percent: 70,
                tolerance_percent: 10,
                window: "5m".into(),
                step,
                cooldown_seconds,
            },
        )
    }

    #[test]
    fn test_scale_up_above_band() {
        let decision = strategy(1, 0).evaluate(3, 95.0, None);
        assert_eq!(decision.desired_replicas, 4);
        assert_eq!(decision.direction, ScaleDirection::Up);
        assert_eq!(decision.current_replicas, 3);
        assert_eq!(decision.observed_metric, 95.0);
    }

    #[test]
    fn test_scale_down_below_band() {
        let decision = strategy(1, 0).evaluate(3, 40.0, None);
        assert_eq!(decision.desired_replicas, 2);
        assert_eq!(decision.direction, ScaleDirection::Down);
    }

    #[test]
    fn test_hold_within_band() {
        let decision = strategy(1, 0).evaluate(3, 68.0, None);
        assert_eq!(decision.desired_replicas, 3);
        assert_eq!(decision.direction, ScaleDirection::Hold);

        // The band edges are inclusive.
        assert_eq!(
            strategy(1, 0).evaluate(3, 80.0, None).direction,
            ScaleDirection::Hold
        );
        assert_eq!(
            strategy(1, 0).evaluate(3, 60.0, None).direction,
            ScaleDirection::Hold
        );
    }

    #[test]
    fn test_hold_at_ceiling_and_floor() {
        let decision = strategy(1, 0).evaluate(10, 95.0, None);
        assert_eq!(decision.desired_replicas, 10);
        assert_eq!(decision.direction, ScaleDirection::Hold);

        let decision = strategy(1, 0).evaluate(2, 5.0, None);
        assert_eq!(decision.desired_replicas, 2);
        assert_eq!(decision.direction, ScaleDirection::Hold);
    }

    #[test]
    fn test_cooldown_suppresses_scaling() {
        let decision = strategy(1, 60).evaluate(3, 95.0, Some(TimeDelta::seconds(10)));
        assert_eq!(decision.desired_replicas, 3);
        assert_eq!(decision.direction, ScaleDirection::Hold);

        let decision = strategy(1, 60).evaluate(3, 95.0, Some(TimeDelta::seconds(60)));
        assert_eq!(decision.direction, ScaleDirection::Up);

        // Never scaled before, so there is nothing to cool down from.
        let decision = strategy(1, 60).evaluate(3, 95.0, None);
        assert_eq!(decision.direction, ScaleDirection::Up);
    }

    #[test]
    fn test_step_is_clamped_to_bounds() {
        assert_eq!(strategy(4, 0).evaluate(8, 99.0, None).desired_replicas, 10);
        assert_eq!(strategy(4, 0).evaluate(4, 1.0, None).desired_replicas, 2);
        assert_eq!(strategy(3, 0).evaluate(4, 99.0, None).desired_replicas, 7);
    }

    fn arbitrary_case() -> impl Strategy<Value = (i32, i32, i32, i32, i32, i32, f64)> {
        (0i32..50, 0i32..50, 0i32..100, 0i32..60, 1i32..8)
            .prop_flat_map(|(min, span, target, tolerance, step)| {
                let max = min + span;
                (
                    Just(min),
                    Just(max),
                    Just(target),
                    Just(tolerance),
                    Just(step),
                    min..=max,
                    0.0f64..200.0,
                )
            })
    }

    fn build(min: i32, max: i32, target: i32, tolerance: i32, step: i32) -> ToleranceBandStrategy {
        ToleranceBandStrategy::new(
            &ScaleBounds {
                min_replicas: min,
                max_replicas: max,
            },
            &Policy {
                cpu_target_percent: target,
                tolerance_percent: tolerance,
                window: "5m".into(),
                step,
                cooldown_seconds: 30,
            },
        )
    }

    proptest! {
        #[test]
        fn prop_desired_within_bounds_and_step(
            (min, max, target, tolerance, step, current, metric) in arbitrary_case()
        ) {
            let decision = build(min, max, target, tolerance, step).evaluate(current, metric, None);
            prop_assert!(decision.desired_replicas >= min);
            prop_assert!(decision.desired_replicas <= max);
            prop_assert!((decision.desired_replicas - current).abs() <= step);
            if decision.direction == ScaleDirection::Hold {
                prop_assert_eq!(decision.desired_replicas, current);
            }
        }

        #[test]
        fn prop_monotonic_in_metric(
            (min, max, target, tolerance, step, current, metric) in arbitrary_case(),
            increase in 0.0f64..100.0
        ) {
            let strategy = build(min, max, target, tolerance, step);
            let lower = strategy.evaluate(current, metric, None);
            let higher = strategy.evaluate(current, metric + increase, None);
            prop_assert!(higher.desired_replicas >= lower.desired_replicas);
        }

        #[test]
        fn prop_cooldown_holds(
            (min, max, target, tolerance, step, current, metric) in arbitrary_case(),
            elapsed in 0i64..30
        ) {
            let decision = build(min, max, target, tolerance, step)
                .evaluate(current, metric, Some(TimeDelta::seconds(elapsed)));
            prop_assert_eq!(decision.direction, ScaleDirection::Hold);
            prop_assert_eq!(decision.desired_replicas, current);
        }
    }
}
