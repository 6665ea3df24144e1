use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use evalexpr::{eval_boolean_with_context, build_operator_tree, HashMapContext, ContextWithMutableVariables, DefaultNumericTypes};
use crate::runtime::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    #[default]
    Disconnected,
    Metered,
    Unmetered,
}

impl NetworkState {
    fn as_str(self) -> &'static str {
        match self {
            NetworkState::Disconnected => "disconnected",
            NetworkState::Metered => "metered",
            NetworkState::Unmetered => "unmetered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkRequirement {
    Connected,
    Unmetered,
}

/// Snapshot of the device conditions constraints are checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub charging: bool,
    pub battery_not_low: bool,
    pub device_idle: bool,
    pub storage_not_low: bool,
    pub network: NetworkState,
    /// Free-form values visible to `Constraint::Expression`.
    pub vars: BTreeMap<String, Value>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            charging: false,
            battery_not_low: true,
            device_idle: false,
            storage_not_low: true,
            network: NetworkState::Disconnected,
            vars: BTreeMap::new(),
        }
    }
}

/// Environmental precondition that gates a task's Blocked -> Running move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Constraint {
    RequiresCharging,
    RequiresBatteryNotLow,
    RequiresDeviceIdle,
    RequiresStorageNotLow,
    RequiresNetwork { network: NetworkRequirement },
    /// Boolean evalexpr expression over the environment, e.g. `charging && network == "unmetered"`.
    Expression { expr: String },
}

impl Constraint {
    /// Only expressions can be malformed; the rest are always well-formed.
    pub fn check_syntax(&self) -> Result<(), String> {
        match self {
            Constraint::Expression { expr } => build_operator_tree::<DefaultNumericTypes>(expr)
                .map(|_| ())
                .map_err(|e| format!("bad constraint expression `{}`: {}", expr, e)),
            _ => Ok(()),
        }
    }
}

/// Pure gate over (task, environment). Called again on every environment change.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstraintEvaluator;

impl ConstraintEvaluator {
    pub fn evaluate(&self, task: &Task, env: &Environment) -> bool {
        self.evaluate_all(&task.constraints, env)
    }

    pub fn evaluate_all(&self, constraints: &[Constraint], env: &Environment) -> bool {
        constraints.iter().all(|c| self.holds(c, env))
    }

    pub fn holds(&self, constraint: &Constraint, env: &Environment) -> bool {
        match constraint {
            Constraint::RequiresCharging => env.charging,
            Constraint::RequiresBatteryNotLow => env.battery_not_low,
            Constraint::RequiresDeviceIdle => env.device_idle,
            Constraint::RequiresStorageNotLow => env.storage_not_low,
            Constraint::RequiresNetwork { network } => match network {
                NetworkRequirement::Connected => env.network != NetworkState::Disconnected,
                NetworkRequirement::Unmetered => env.network == NetworkState::Unmetered,
            },
            // Evaluation errors (unknown variable, wrong type) count as unmet.
            Constraint::Expression { expr } => {
                eval_boolean_with_context(expr, &expression_context(env)).unwrap_or(false)
            }
        }
    }
}

fn expression_context(env: &Environment) -> HashMapContext<DefaultNumericTypes> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in &env.vars {
        let ev = match v {
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() { Some(evalexpr::Value::Int(i)) }
                else { n.as_f64().map(evalexpr::Value::Float) }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            _ => None,
        };
        if let Some(ev) = ev {
            let _ = ctx.set_value(k.clone(), ev);
        }
    }
    // Built-in conditions win over a var of the same name.
    let _ = ctx.set_value("charging".into(), evalexpr::Value::Boolean(env.charging));
    let _ = ctx.set_value("battery_not_low".into(), evalexpr::Value::Boolean(env.battery_not_low));
    let _ = ctx.set_value("device_idle".into(), evalexpr::Value::Boolean(env.device_idle));
    let _ = ctx.set_value("storage_not_low".into(), evalexpr::Value::Boolean(env.storage_not_low));
    let _ = ctx.set_value("network".into(), evalexpr::Value::String(env.network.as_str().to_string()));
    ctx
}
