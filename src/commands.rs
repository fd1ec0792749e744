//! Command execution.

use crate::Commands;
use fsmkit_core::{Context, CoreError, HandlerTable, StateMachineEngine};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("[{}] {0}", .0.error_code())]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("context must be a JSON object, got: {0}")]
    NotAnObject(Value),
}

/// Named handlers available to definition documents loaded by the CLI.
///
/// - `record_event`: stores the triggering event and target state in the
///   context as `last_event` / `last_state`.
pub fn builtin_handlers() -> HandlerTable {
    HandlerTable::new().with_action("record_event", |ctx| {
        ctx.context.insert("last_event".to_string(), json!(ctx.event));
        ctx.context.insert("last_state".to_string(), json!(ctx.to_state));
        Ok(())
    })
}

/// Executes a command and returns the formatted output.
pub fn execute(engine: &StateMachineEngine, cmd: Commands) -> Result<String, CommandError> {
    let output = match cmd {
        Commands::Machines => {
            let registry = engine.registry();
            let machines: Vec<Value> = registry
                .machine_ids()
                .into_iter()
                .filter_map(|id| registry.get(&id))
                .map(|def| {
                    json!({
                        "id": def.id(),
                        "initial": def.initial_state(),
                        "states": def.states(),
                        "end_states": def.end_states(),
                        "transitions": def.transitions().len(),
                    })
                })
                .collect();
            Value::Array(machines)
        }

        Commands::Show { machine } => {
            let def = engine.registry().require(&machine)?;
            serde_json::to_value(def.to_raw())?
        }

        Commands::Init {
            machine,
            entity,
            ctx,
            force,
        } => {
            let context = parse_context(ctx.as_deref())?;
            let record = if force {
                engine.reinitialize(&machine, &entity, context)?
            } else {
                engine.initialize(&machine, &entity, context)?
            };
            serde_json::to_value(record)?
        }

        Commands::Send {
            machine,
            entity,
            event,
            ctx,
        } => {
            let context = parse_context(ctx.as_deref())?;
            serde_json::to_value(engine.send_event(&machine, &entity, &event, context)?)?
        }

        Commands::Force {
            machine,
            entity,
            state,
        } => serde_json::to_value(engine.force_state(&machine, &entity, &state)?)?,

        Commands::Get { machine, entity } => {
            let record = engine
                .get_state(&machine, &entity)?
                .ok_or(CoreError::StateNotFound { machine, entity })?;
            serde_json::to_value(record)?
        }

        Commands::Events { machine, entity } => json!(engine.available_events(&machine, &entity)?),

        Commands::CanSend {
            machine,
            entity,
            event,
        } => {
            let allowed = engine.can_send_event(&machine, &entity, &event);
            json!({ "event": event, "allowed": allowed })
        }

        Commands::List { machine } => {
            engine.registry().require(&machine)?;
            json!(engine.list_entities(&machine)?)
        }

        Commands::Remove { machine, entity } => {
            json!({ "removed": engine.remove_state(&machine, &entity)? })
        }
    };

    Ok(format_json(&output))
}

/// Parses a context argument: inline JSON, or `@path` to read a file.
fn parse_context(arg: Option<&str>) -> Result<Context, CommandError> {
    let Some(arg) = arg else {
        return Ok(Context::new());
    };

    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).map_err(|source| CommandError::Io {
            path: path.to_string(),
            source,
        })?,
        None => arg.to_string(),
    };

    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        other => Err(CommandError::NotAnObject(other)),
    }
}

fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
