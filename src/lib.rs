pub mod chart;
pub mod cli;
pub mod config;
pub mod export;
pub mod graph;
pub mod pdf;
pub mod pipeline;
pub mod report;
pub mod stats;
pub mod summary;
pub mod timeframe;
pub mod trend;
pub mod units;
pub mod zabbix;

pub use config::{load_config, Config, ConfigError};
pub use pipeline::{spawn_run, RunEvent, RunOptions, RunSummary, SessionContext};
pub use stats::{compute, StatisticsSummary};
pub use timeframe::{resolve, TimeRange, TimeRangeKind, TimeframeError};
pub use trend::{TrendPoint, TrendSeries};
