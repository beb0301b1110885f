//! Scheduling tools: let the backend queue messages for later.
//!
//! Tools exposed:
//! - `schedule_delayed { message, delay_seconds, invoke_agent?, description? }`
//! - `schedule_recurring { message, interval_seconds, invoke_agent?, description? }`
//! - `schedule_cron { message, cron_expression, invoke_agent?, description? }`
//! - `list_scheduled {}`
//! - `cancel_scheduled { job_id }`
//!
//! Jobs always target the conversation the call was made from.

use serde_json::{json, Value};

use super::{secs_arg, str_arg, ToolContext, ToolMeta, Toolbox};
use crate::scheduler::JobRequest;

fn job_request(tool: &str, args: &Value, ctx: &ToolContext) -> anyhow::Result<JobRequest> {
    Ok(JobRequest {
        conversation_key: Some(ctx.conversation_key.clone()),
        target: ctx.target.clone(),
        message: str_arg(tool, args, "message")?.to_string(),
        description: args["description"]
            .as_str()
            .filter(|d| !d.trim().is_empty())
            .map(String::from),
        invoke_backend: args["invoke_agent"].as_bool().unwrap_or(false),
    })
}

fn scheduled(job_id: String, args: &Value) -> Value {
    json!({
        "status": "scheduled",
        "job_id": job_id,
        "invoke_agent": args["invoke_agent"].as_bool().unwrap_or(false),
    })
}

/// `schedule_delayed`: fire once after a delay.
pub async fn schedule_delayed(tb: &Toolbox, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
    let req = job_request("schedule_delayed", &args, ctx)?;
    let delay = secs_arg("schedule_delayed", &args, "delay_seconds")?;
    let id = tb.scheduler.schedule_delayed(req, delay).await?;
    Ok(scheduled(id, &args))
}

/// `schedule_recurring`: fire every N seconds until cancelled.
pub async fn schedule_recurring(tb: &Toolbox, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
    let req = job_request("schedule_recurring", &args, ctx)?;
    let interval = secs_arg("schedule_recurring", &args, "interval_seconds")?;
    let id = tb.scheduler.schedule_recurring(req, interval).await?;
    Ok(scheduled(id, &args))
}

/// `schedule_cron`: fire on a 5-field cron expression.
pub async fn schedule_cron(tb: &Toolbox, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
    let req = job_request("schedule_cron", &args, ctx)?;
    let expression = str_arg("schedule_cron", &args, "cron_expression")?;
    let id = tb.scheduler.schedule_cron(req, expression).await?;
    Ok(scheduled(id, &args))
}

/// `list_scheduled`: every job, oldest first.
pub async fn list_scheduled(tb: &Toolbox, _args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
    let jobs = tb.scheduler.list().await;
    Ok(json!({ "count": jobs.len(), "jobs": jobs }))
}

/// `cancel_scheduled`: remove a job by id.
pub async fn cancel_scheduled(tb: &Toolbox, args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
    let job_id = str_arg("cancel_scheduled", &args, "job_id")?;
    if tb.scheduler.cancel(job_id).await {
        Ok(json!({ "status": "cancelled", "job_id": job_id }))
    } else {
        anyhow::bail!("no scheduled job with id '{job_id}'")
    }
}

fn common_properties() -> serde_json::Map<String, Value> {
    let mut props = serde_json::Map::new();
    props.insert(
        "message".into(),
        json!({ "type": "string", "description": "Text to deliver (or to send to the assistant) when the job fires" }),
    );
    props.insert(
        "invoke_agent".into(),
        json!({ "type": "boolean", "description": "When true the message is processed by the assistant instead of sent verbatim" }),
    );
    props.insert(
        "description".into(),
        json!({ "type": "string", "description": "Optional label shown in job listings" }),
    );
    props
}

fn schema_with(field: &str, field_schema: Value) -> Value {
    let mut props = common_properties();
    props.insert(field.to_string(), field_schema);
    json!({
        "type": "object",
        "properties": props,
        "required": ["message", field],
    })
}

pub fn metas() -> Vec<ToolMeta> {
    vec![
        ToolMeta {
            name: "schedule_delayed".into(),
            description: "Schedule a one-time message to this conversation after a delay in seconds.".into(),
            args_schema: schema_with(
                "delay_seconds",
                json!({ "type": "integer", "minimum": 1, "description": "Seconds to wait before firing" }),
            ),
        },
        ToolMeta {
            name: "schedule_recurring".into(),
            description: "Schedule a message to this conversation every N seconds until cancelled.".into(),
            args_schema: schema_with(
                "interval_seconds",
                json!({ "type": "integer", "minimum": 1, "description": "Seconds between firings" }),
            ),
        },
        ToolMeta {
            name: "schedule_cron".into(),
            description: "Schedule a message using a 5-field cron expression (minute hour day-of-month month day-of-week).".into(),
            args_schema: schema_with(
                "cron_expression",
                json!({ "type": "string", "description": "Cron expression, e.g. '0 9 * * 1-5' for 09:00 on weekdays" }),
            ),
        },
        ToolMeta {
            name: "list_scheduled".into(),
            description: "List scheduled jobs with their next run time and run count.".into(),
            args_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolMeta {
            name: "cancel_scheduled".into(),
            description: "Cancel a scheduled job by id.".into(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "job_id": { "type": "string", "description": "Id returned when the job was scheduled" }
                },
                "required": ["job_id"]
            }),
        },
    ]
}
