// Order execution and position monitoring module
pub mod executor;
pub mod trailing;

pub use executor::{CloseReport, ExecutionReport, ExecutorConfig, OrderExecutor, FEE_RATE};
pub use trailing::{CloseDispatch, MonitorReport, TrailingStopMonitor};
