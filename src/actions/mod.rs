use std::fmt::Debug;

use anyhow::Result;
use serde_json::Value;

use crate::runtime::context::ActivityExecution;

pub mod builtin;

/// 插件接口：服务任务的执行逻辑必须实现此 Trait
///
/// `params` arrive with `${var}` placeholders already resolved. Returning a
/// [`BpmnError`](crate::error::BpmnError) (through `anyhow`) raises a business
/// error that error boundary events can catch; any other error is a fault.
pub trait TaskHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    fn execute(&self, params: Value, execution: &mut ActivityExecution<'_>) -> Result<Value>;
}
