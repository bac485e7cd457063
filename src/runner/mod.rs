//! 批量作业模块
//!
//! 读取作业文件，在多台主机上并发执行并生成报告。

pub mod batch;
pub mod types;

pub use batch::{dial_with_retry, run_host, run_job};
pub use types::{HostReport, Job};
