//! ReAct 操作器：Planner、scratchpad、观察格式化、失败循环检测与主循环

pub mod detector;
pub mod loop_;
pub mod observation;
pub mod planner;
pub mod scratchpad;

pub use detector::FailureLoopDetector;
pub use loop_::{OperatorOutcome, OperatorStatus, ReactConfig, ReactOperator, Termination, PLAN_ERROR_ACTION};
pub use observation::ObservationFormat;
pub use planner::{
    parse_planner_output, planned_step_schema_json, LlmPlanner, PlanContext, PlanError, PlannedStep, Planner,
    COMPLETION_ACTION,
};
pub use scratchpad::{Scratchpad, Step};
