//! 认知层：Planner、Dispatcher、Observation、Finalizer 与 ReAct 主循环

pub mod dispatcher;
pub mod finalizer;
pub mod loop_;
pub mod observer;
pub mod planner;
pub mod prompts;

pub use dispatcher::{DispatchStatus, Dispatcher, ToolOutcome};
pub use finalizer::Finalizer;
pub use loop_::{react_loop, ReactResult, ReactSession};
pub use observer::ObservationSummarizer;
pub use planner::{parse_plan, Instrument, Plan, PlanArgs, Planner};
