//! 触发器求值：纯函数 (trigger, now, state, inactivity) -> fire?
//!
//! 求值之后再叠加全局闸门（pauseAll / 静默时段 / 用户活跃暂停 / 并发上限），
//! 闸门与触发器本身相互独立。

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::spec::{parse_hhmm, GlobalSettings, Trigger};

/// 触发器求值错误：调用方一律视为不触发
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvalError {
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("interval must be positive")]
    ZeroInterval,
    #[error("inactivity threshold must be positive")]
    ZeroThreshold,
}

/// 每个 agent 的触发状态（热更新时保留，触发器类型变化时重置）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerState {
    pub last_fire_at: Option<DateTime<Utc>>,
    /// Activity 触发器：触发后解除，用户重新活跃后再装填
    pub armed: bool,
}

impl Default for TriggerState {
    fn default() -> Self {
        Self {
            last_fire_at: None,
            armed: true,
        }
    }
}

impl TriggerState {
    /// 新注册 agent 的初始状态：Interval / TimeOfDay 以注册时刻为起点，
    /// 即注册后等待一个完整周期或下一次跨越时刻
    pub fn seeded(trigger: &Trigger, now: DateTime<Utc>) -> Self {
        match trigger {
            Trigger::Interval { .. } | Trigger::TimeOfDay { .. } => Self {
                last_fire_at: Some(now),
                armed: true,
            },
            _ => Self::default(),
        }
    }

    /// 记录一次触发
    pub fn record_fire(&mut self, trigger: &Trigger, now: DateTime<Utc>) {
        self.last_fire_at = Some(now);
        if matches!(trigger, Trigger::Activity { .. }) {
            self.armed = false;
        }
    }

    /// 观察活跃信号：不活跃时长回落到阈值以下即重新装填
    pub fn observe_activity(&mut self, trigger: &Trigger, inactivity_secs: u64) {
        if let Trigger::Activity { inactivity } = trigger {
            if inactivity_secs < *inactivity {
                self.armed = true;
            }
        }
    }
}

/// 判断触发器此刻是否应触发
///
/// `now` 的时区决定 TimeOfDay 的「当天」：调度器传本地时间，测试可传 UTC。
pub fn should_fire<Tz: TimeZone>(
    trigger: &Trigger,
    now: &DateTime<Tz>,
    state: &TriggerState,
    inactivity_secs: u64,
) -> Result<bool, TriggerEvalError> {
    let now_utc = now.with_timezone(&Utc);
    match trigger {
        Trigger::Interval { interval } => {
            if *interval == 0 {
                return Err(TriggerEvalError::ZeroInterval);
            }
            Ok(match state.last_fire_at {
                None => true,
                Some(last) => (now_utc - last).num_seconds() >= *interval as i64,
            })
        }
        Trigger::TimeOfDay { time } => {
            let at = parse_hhmm(time).ok_or_else(|| TriggerEvalError::InvalidTime(time.clone()))?;
            let Some(crossing) = todays_crossing(now, at) else {
                // 该时刻落在夏令时跳变的空档里，今天不存在
                return Ok(false);
            };
            if now_utc < crossing {
                return Ok(false);
            }
            Ok(state.last_fire_at.map_or(true, |last| last < crossing))
        }
        Trigger::Activity { inactivity } => {
            if *inactivity == 0 {
                return Err(TriggerEvalError::ZeroThreshold);
            }
            Ok(state.armed && inactivity_secs >= *inactivity)
        }
        Trigger::Event { .. } | Trigger::Manual => Ok(false),
    }
}

/// `now` 所在日历日的 `at` 时刻（UTC）
fn todays_crossing<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> Option<DateTime<Utc>> {
    let local = now.date_naive().and_time(at);
    now.timezone()
        .from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 当前 Running 的 agent 数，按是否使用 LLM 分区
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningCounts {
    pub llm: usize,
    pub non_llm: usize,
}

impl RunningCounts {
    pub fn total(&self) -> usize {
        self.llm + self.non_llm
    }

    pub fn add(&mut self, uses_llm: bool) {
        if uses_llm {
            self.llm += 1;
        } else {
            self.non_llm += 1;
        }
    }
}

/// 全局闸门否决原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVeto {
    PausedAll,
    QuietHours,
    UserActive,
    MaxConcurrent,
    MaxConcurrentLlm,
    MaxConcurrentNonLlm,
}

impl GateVeto {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateVeto::PausedAll => "paused_all",
            GateVeto::QuietHours => "quiet_hours",
            GateVeto::UserActive => "user_active",
            GateVeto::MaxConcurrent => "max_concurrent",
            GateVeto::MaxConcurrentLlm => "max_concurrent_llm",
            GateVeto::MaxConcurrentNonLlm => "max_concurrent_non_llm",
        }
    }
}

/// 全局闸门：返回第一个否决原因，None 表示放行
pub fn apply_gates(
    settings: &GlobalSettings,
    local_time: NaiveTime,
    inactivity_secs: u64,
    running: RunningCounts,
    uses_llm: bool,
) -> Option<GateVeto> {
    if settings.pause_all {
        return Some(GateVeto::PausedAll);
    }
    if settings.quiet_hours.contains(local_time) {
        return Some(GateVeto::QuietHours);
    }
    if settings.pause_queue_on_activity && inactivity_secs < settings.activity_resume_delay {
        return Some(GateVeto::UserActive);
    }
    if running.total() >= settings.max_concurrent_agents {
        return Some(GateVeto::MaxConcurrent);
    }
    if uses_llm && running.llm >= settings.max_concurrent_llm_agents {
        return Some(GateVeto::MaxConcurrentLlm);
    }
    if !uses_llm && running.non_llm >= settings.max_concurrent_non_llm_agents {
        return Some(GateVeto::MaxConcurrentNonLlm);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_interval_fires_on_each_period() {
        let trigger = Trigger::Interval { interval: 60 };
        let t0 = at(10, 0, 0);
        let mut state = TriggerState::seeded(&trigger, t0);
        let mut fired_at = Vec::new();

        // 每秒一个 tick，模拟 0..=180 秒
        for s in 0..=180 {
            let now = t0 + Duration::seconds(s);
            if should_fire(&trigger, &now, &state, 0).unwrap() {
                state.record_fire(&trigger, now);
                fired_at.push(s);
            }
        }
        assert_eq!(fired_at, vec![60, 120, 180]);
    }

    #[test]
    fn test_interval_never_fired_fires_immediately() {
        let trigger = Trigger::Interval { interval: 300 };
        assert!(should_fire(&trigger, &at(8, 0, 0), &TriggerState::default(), 0).unwrap());
    }

    #[test]
    fn test_time_of_day_fires_once_per_day() {
        let trigger = Trigger::TimeOfDay {
            time: "09:30".into(),
        };
        let mut state = TriggerState {
            last_fire_at: Some(at(0, 0, 0) - Duration::days(1)),
            armed: true,
        };
        assert!(!should_fire(&trigger, &at(9, 29, 59), &state, 0).unwrap());

        let mut fires = 0;
        // 09:30:00 ~ 09:31:00 同一分钟窗口内多次 tick，只触发一次
        for s in 0..=60 {
            let now = at(9, 30, 0) + Duration::seconds(s);
            if should_fire(&trigger, &now, &state, 0).unwrap() {
                state.record_fire(&trigger, now);
                fires += 1;
            }
        }
        assert_eq!(fires, 1);
        assert!(!should_fire(&trigger, &at(23, 59, 0), &state, 0).unwrap());

        // 次日跨越后再次触发
        let tomorrow = at(9, 30, 5) + Duration::days(1);
        assert!(should_fire(&trigger, &tomorrow, &state, 0).unwrap());
    }

    #[test]
    fn test_time_of_day_missed_crossing_fires_once_on_resume() {
        let trigger = Trigger::TimeOfDay {
            time: "02:00".into(),
        };
        // 昨天 02:00 触发过，今天 02:00 调度器停机，08:00 恢复
        let mut state = TriggerState {
            last_fire_at: Some(at(2, 0, 0) - Duration::days(1)),
            armed: true,
        };
        let resume = at(8, 0, 0);
        assert!(should_fire(&trigger, &resume, &state, 0).unwrap());
        state.record_fire(&trigger, resume);
        assert!(!should_fire(&trigger, &(resume + Duration::seconds(5)), &state, 0).unwrap());
        assert!(!should_fire(&trigger, &at(23, 0, 0), &state, 0).unwrap());
    }

    #[test]
    fn test_time_of_day_invalid_is_error() {
        let trigger = Trigger::TimeOfDay {
            time: "nine".into(),
        };
        assert_eq!(
            should_fire(&trigger, &at(9, 0, 0), &TriggerState::default(), 0),
            Err(TriggerEvalError::InvalidTime("nine".into()))
        );
    }

    #[test]
    fn test_activity_fires_once_until_rearmed() {
        let trigger = Trigger::Activity { inactivity: 600 };
        let mut state = TriggerState::default();
        let now = at(12, 0, 0);

        state.observe_activity(&trigger, 599);
        assert!(!should_fire(&trigger, &now, &state, 599).unwrap());

        state.observe_activity(&trigger, 600);
        assert!(should_fire(&trigger, &now, &state, 600).unwrap());
        state.record_fire(&trigger, now);

        // 阈值持续超过：不会每个 tick 都触发
        for idle in [601, 700, 5000] {
            state.observe_activity(&trigger, idle);
            assert!(!should_fire(&trigger, &now, &state, idle).unwrap());
        }

        // 用户重新活跃，随后再次空闲足够久
        state.observe_activity(&trigger, 3);
        assert!(state.armed);
        state.observe_activity(&trigger, 650);
        assert!(should_fire(&trigger, &now, &state, 650).unwrap());
    }

    #[test]
    fn test_manual_and_event_never_fire() {
        let state = TriggerState::default();
        assert!(!should_fire(&Trigger::Manual, &at(1, 0, 0), &state, 99_999).unwrap());
        let event = Trigger::Event {
            event: "inbox".into(),
        };
        assert!(!should_fire(&event, &at(1, 0, 0), &state, 99_999).unwrap());
    }

    #[test]
    fn test_gates_veto_in_order() {
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let mut settings = GlobalSettings::default();
        assert_eq!(apply_gates(&settings, noon, 0, RunningCounts::default(), true), None);

        settings.pause_all = true;
        assert_eq!(
            apply_gates(&settings, noon, 0, RunningCounts::default(), true),
            Some(GateVeto::PausedAll)
        );
        settings.pause_all = false;

        settings.pause_queue_on_activity = true;
        settings.activity_resume_delay = 60;
        assert_eq!(
            apply_gates(&settings, noon, 10, RunningCounts::default(), true),
            Some(GateVeto::UserActive)
        );
        assert_eq!(apply_gates(&settings, noon, 60, RunningCounts::default(), true), None);
        settings.pause_queue_on_activity = false;

        let one_llm = RunningCounts { llm: 1, non_llm: 0 };
        assert_eq!(
            apply_gates(&settings, noon, 0, one_llm, true),
            Some(GateVeto::MaxConcurrentLlm)
        );
        assert_eq!(apply_gates(&settings, noon, 0, one_llm, false), None);

        let full = RunningCounts { llm: 1, non_llm: 2 };
        assert_eq!(
            apply_gates(&settings, noon, 0, full, false),
            Some(GateVeto::MaxConcurrent)
        );
    }

    #[test]
    fn test_quiet_hours_gate() {
        let mut settings = GlobalSettings::default();
        settings.quiet_hours.enabled = true;
        let night = NaiveTime::from_hms_opt(1, 0, 0).unwrap();
        assert_eq!(
            apply_gates(&settings, night, 0, RunningCounts::default(), false),
            Some(GateVeto::QuietHours)
        );
    }
}
