//! 失败循环检测
//!
//! 两种信号，任一连续重复达到阈值即触发：
//! - 同一 (action, actionInput) 且观察结果没有变化
//! - 同一错误类别
//!
//! 阈值 2 时，三次相同的失败调用在第 3 轮触发。

use serde_json::Value;

use crate::react::scratchpad::Step;
use crate::skills::ErrorClass;

#[derive(Debug)]
pub struct FailureLoopDetector {
    threshold: usize,
    last_call: Option<(String, Value, Value)>,
    repeat_streak: usize,
    last_error: Option<ErrorClass>,
    error_streak: usize,
}

impl FailureLoopDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            last_call: None,
            repeat_streak: 0,
            last_error: None,
            error_streak: 0,
        }
    }

    /// 记录一步；触发时返回原因
    pub fn observe(&mut self, step: &Step) -> Option<String> {
        let call = (step.action.clone(), step.action_input.clone(), step.raw.clone());
        if self.last_call.as_ref() == Some(&call) {
            self.repeat_streak += 1;
        } else {
            self.repeat_streak = 0;
        }
        self.last_call = Some(call);

        match step.error_class {
            Some(class) if self.last_error == Some(class) => self.error_streak += 1,
            Some(class) => {
                self.last_error = Some(class);
                self.error_streak = 0;
            }
            None => {
                self.last_error = None;
                self.error_streak = 0;
            }
        }

        if self.repeat_streak >= self.threshold {
            return Some(format!(
                "action '{}' repeated {} times with identical input and no new information",
                step.action,
                self.repeat_streak + 1
            ));
        }
        if self.error_streak >= self.threshold {
            if let Some(class) = self.last_error {
                return Some(format!(
                    "error class {} repeated {} consecutive times",
                    class,
                    self.error_streak + 1
                ));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(action: &str, input: Value, raw: Value, class: Option<ErrorClass>) -> Step {
        Step::new("", action, input).observed(String::new(), raw, class)
    }

    #[test]
    fn test_identical_failures_trip_on_third() {
        let mut d = FailureLoopDetector::new(2);
        let s = step("fs_read", json!({"path": "x"}), json!({"error": "missing"}), Some(ErrorClass::ExecutionError));
        assert!(d.observe(&s).is_none());
        assert!(d.observe(&s).is_none());
        assert!(d.observe(&s).is_some());
    }

    #[test]
    fn test_same_error_class_with_varied_inputs_trips() {
        let mut d = FailureLoopDetector::new(2);
        for (i, expect) in [(1, false), (2, false), (3, true)] {
            let s = step(
                "fs_read",
                json!({"path": format!("f{}", i)}),
                json!({"error": i}),
                Some(ErrorClass::SandboxViolation),
            );
            assert_eq!(d.observe(&s).is_some(), expect, "iteration {}", i);
        }
    }

    #[test]
    fn test_progress_resets_streaks() {
        let mut d = FailureLoopDetector::new(2);
        let fail = step("fs_read", json!({"path": "x"}), json!({"error": "missing"}), Some(ErrorClass::ExecutionError));
        let ok = step("fs_list", json!({}), json!({"entries": []}), None);
        assert!(d.observe(&fail).is_none());
        assert!(d.observe(&fail).is_none());
        assert!(d.observe(&ok).is_none());
        assert!(d.observe(&fail).is_none());
        assert!(d.observe(&fail).is_none());
    }

    #[test]
    fn test_repeat_with_new_information_is_not_a_loop() {
        let mut d = FailureLoopDetector::new(2);
        for n in 0..5 {
            let s = step("fs_list", json!({}), json!({"entries": n}), None);
            assert!(d.observe(&s).is_none());
        }
    }
}
